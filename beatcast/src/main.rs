use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use beatcast_session::{
    init_logging, Config, ConnectionFactory, LocalMedia, LocalTrack, LoopClock, ParticipantId, Session,
    SessionDriver, SessionHandle, SessionHub, SessionId, SessionNotice, SessionParams, TrackFeed,
    WebRtcConnectionFactory,
};

/// Opus frame of digital silence (20 ms, stereo)
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "beatcast", version, about = "Realtime beat broadcast sessions")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "BEATCAST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a host and several viewers in one process over real WebRTC connections
    Simulate {
        /// Number of viewers joining the session
        #[arg(long, default_value_t = 2)]
        viewers: usize,
        /// How long to broadcast
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[arg(long, default_value = "demo")]
        session: String,
        /// Length of the beat loop in seconds
        #[arg(long, default_value_t = 8.0)]
        loop_seconds: f64,
    },
    /// Print the effective configuration
    Config,
}

struct Running {
    name: String,
    handle: SessionHandle,
    task: JoinHandle<Session>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate {
            viewers,
            seconds,
            session,
            loop_seconds,
        } => {
            init_logging(&config.logging)?;
            simulate(&config, SessionId::from(session), viewers, Duration::from_secs(seconds), loop_seconds).await
        }
    }
}

async fn simulate(
    config: &Config,
    session_id: SessionId,
    viewer_count: usize,
    duration: Duration,
    loop_seconds: f64,
) -> Result<()> {
    info!(
        session_id = %session_id,
        viewers = viewer_count,
        seconds = duration.as_secs(),
        "Starting simulated broadcast"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    let hub = SessionHub::new();
    let factory: Arc<dyn ConnectionFactory> = Arc::new(WebRtcConnectionFactory::new(&config.webrtc)?);

    // Host, fed by a stand-in audio engine
    let (track, sample) = LocalTrack::opus(format!("master-{}", nanoid::nanoid!(6)), "beatcast");
    let mut writer = spawn_silence_writer(sample, cancel.child_token());
    let (feed_tx, feed_rx) = watch::channel(Some(track));

    let clock = Arc::new(LoopClock::new(loop_seconds));
    clock.play();
    let host = spawn_member(config, &hub, &session_id, "host", &factory, clock, Some(feed_rx), &cancel).await?;
    host.handle.start_as_host().await?;

    let mut members = vec![host];
    for n in 1..=viewer_count {
        let name = format!("viewer-{n}");
        let viewer = spawn_member(
            config,
            &hub,
            &session_id,
            &name,
            &factory,
            Arc::new(LoopClock::default()),
            None,
            &cancel,
        )
        .await?;
        viewer.handle.start_as_viewer().await?;
        members.push(viewer);
    }

    // Swap the master track halfway, as an engine mode change would
    if sleep_or_cancel(duration / 2, &cancel).await {
        let (track, sample) = LocalTrack::opus(format!("master-{}", nanoid::nanoid!(6)), "beatcast");
        let next_writer = spawn_silence_writer(sample, cancel.child_token());
        info!(track_id = %track.id(), "Swapping master track");
        feed_tx.send_replace(Some(track));
        writer.cancel();
        writer = next_writer;

        sleep_or_cancel(duration - duration / 2, &cancel).await;
    }

    if let Some(host) = members.first() {
        match host.handle.status().await {
            Ok(status) => info!(status = %serde_json::to_string(&status)?, "Host status"),
            Err(err) => warn!(error = %err, "Host status unavailable"),
        }
    }

    writer.cancel();
    cancel.cancel();
    for member in members {
        match member.task.await {
            Ok(session) => info!(participant = %member.name, state = %session.state(), "Participant finished"),
            Err(err) => error!(participant = %member.name, error = %err, "Participant task failed"),
        }
    }
    info!("Simulation finished");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn spawn_member(
    config: &Config,
    hub: &SessionHub,
    session_id: &SessionId,
    name: &str,
    factory: &Arc<dyn ConnectionFactory>,
    clock: Arc<LoopClock>,
    feed: Option<TrackFeed>,
    cancel: &CancellationToken,
) -> Result<Running> {
    let (channel, events) = hub.connect(session_id.clone(), ParticipantId::new(name));
    let (session, link_events) = Session::new(SessionParams {
        username: name.to_string(),
        config: config.session.clone(),
        channel: Arc::new(channel),
        connections: Arc::clone(factory),
        clock,
        local_media: LocalMedia::default(),
    });

    let mut driver = SessionDriver::new(session, link_events, events).with_cancellation(cancel.child_token());
    if let Some(feed) = feed {
        driver = driver.with_track_feed(feed);
    }
    let (handle, task) = driver.spawn();

    let notices = handle.subscribe_notices().await?;
    tokio::spawn(log_notices(name.to_string(), notices));

    Ok(Running {
        name: name.to_string(),
        handle,
        task,
    })
}

async fn log_notices(name: String, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::StateChanged(state) => info!(participant = %name, state = %state, "Session state"),
            SessionNotice::LinkStateChanged { peer, state } => {
                info!(participant = %name, peer = %peer, state = %state, "Link state");
            }
            SessionNotice::RemoteMedia { peer, media } => {
                info!(participant = %name, peer = %peer, kind = %media.kind, track_id = %media.track_id, "Receiving media");
            }
            SessionNotice::SyncApplied { from, snapshot } => {
                info!(
                    participant = %name,
                    from = %from,
                    current_time = snapshot.current_time,
                    is_playing = snapshot.is_playing,
                    "Playback synced"
                );
            }
            SessionNotice::Warning { peer, message } => {
                warn!(participant = %name, peer = ?peer.as_ref().map(ParticipantId::as_str), message = %message, "Session warning");
            }
        }
    }
}

/// Write Opus silence into `sample` until `cancel` fires
fn spawn_silence_writer(sample: Arc<TrackLocalStaticSample>, cancel: CancellationToken) -> CancellationToken {
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let frame = Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: FRAME,
                        ..Default::default()
                    };
                    if let Err(err) = sample.write_sample(&frame).await {
                        warn!(error = %err, "Failed to write audio sample");
                    }
                }
            }
        }
    });
    token
}

/// Returns false when cancelled before the timeout
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}
