//! Event loop that owns a [`Session`]
//!
//! The driver task is the only place the session is touched. Transport
//! events, connection callbacks, upstream track changes and API commands are
//! multiplexed with `select!` and applied one at a time; API calls reach the
//! task through a [`SessionHandle`] and get their result over a oneshot.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::ChannelEvent;
use crate::error::{Error, Result};
use crate::link::LinkEvent;
use crate::media::LocalTrack;
use crate::session::{Session, SessionNotice, SessionStatus};

/// Latest track published by the audio engine; `None` until one exists
pub type TrackFeed = watch::Receiver<Option<LocalTrack>>;

enum Command {
    StartAsHost(oneshot::Sender<Result<()>>),
    StartAsViewer(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    ToggleAudio(oneshot::Sender<Result<bool>>),
    ToggleVideo(oneshot::Sender<Result<bool>>),
    SetMasterTrack(LocalTrack, oneshot::Sender<Result<()>>),
    ClearMasterVideo(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<SessionStatus>),
    SubscribeNotices(oneshot::Sender<mpsc::UnboundedReceiver<SessionNotice>>),
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn start_as_host(&self) -> Result<()> {
        self.request(Command::StartAsHost).await?
    }

    pub async fn start_as_viewer(&self) -> Result<()> {
        self.request(Command::StartAsViewer).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await?
    }

    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(Command::ToggleAudio).await?
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(Command::ToggleVideo).await?
    }

    pub async fn set_master_track(&self, track: LocalTrack) -> Result<()> {
        self.request(|tx| Command::SetMasterTrack(track, tx)).await?
    }

    pub async fn clear_master_video(&self) -> Result<()> {
        self.request(Command::ClearMasterVideo).await?
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }

    pub async fn subscribe_notices(&self) -> Result<mpsc::UnboundedReceiver<SessionNotice>> {
        self.request(Command::SubscribeNotices).await
    }

    /// Ask the driver to stop the session and exit
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

pub struct SessionDriver {
    session: Session,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    track_feed: Option<TrackFeed>,
    cancel: CancellationToken,
}

impl SessionDriver {
    #[must_use]
    pub fn new(
        session: Session,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            session,
            link_events,
            channel_events,
            track_feed: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Follow master track changes published by the audio engine
    #[must_use]
    pub fn with_track_feed(mut self, feed: TrackFeed) -> Self {
        self.track_feed = Some(feed);
        self
    }

    /// Stop when `cancel` fires (in addition to [`SessionHandle::shutdown`])
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the loop on its own task; the task yields the session back on exit
    pub fn spawn(self) -> (SessionHandle, JoinHandle<Session>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: commands_tx,
            cancel: self.cancel.clone(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) -> Session {
        let Self {
            mut session,
            mut link_events,
            mut channel_events,
            mut track_feed,
            cancel,
        } = self;

        info!(
            session_id = %session.session_id(),
            local_id = %session.local_id(),
            "Session driver started"
        );

        let initial = track_feed.as_mut().and_then(|feed| feed.borrow_and_update().clone());
        if let Some(track) = initial {
            apply_track(&mut session, track).await;
        }

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("Session driver cancelled");
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Every session handle dropped");
                        break;
                    };
                    handle_command(&mut session, command).await;
                }
                Some(event) = channel_events.recv() => {
                    session.handle_channel_event(event).await;
                }
                Some(event) = link_events.recv() => {
                    session.handle_link_event(event).await;
                }
                Some(track) = next_track(&mut track_feed) => {
                    apply_track(&mut session, track).await;
                }
            }
        }

        if let Err(err) = session.stop().await {
            error!(error = %err, "Failed to stop session on shutdown");
        }
        info!(session_id = %session.session_id(), "Session driver stopped");
        session
    }
}

async fn handle_command(session: &mut Session, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        Command::StartAsHost(reply) => {
            let _ = reply.send(session.start_as_host().await);
        }
        Command::StartAsViewer(reply) => {
            let _ = reply.send(session.start_as_viewer().await);
        }
        Command::Stop(reply) => {
            let _ = reply.send(session.stop().await);
        }
        Command::ToggleAudio(reply) => {
            let _ = reply.send(session.toggle_audio().await);
        }
        Command::ToggleVideo(reply) => {
            let _ = reply.send(session.toggle_video().await);
        }
        Command::SetMasterTrack(track, reply) => {
            let _ = reply.send(session.set_master_track(track).await);
        }
        Command::ClearMasterVideo(reply) => {
            let _ = reply.send(session.clear_master_video().await);
        }
        Command::Status(reply) => {
            let _ = reply.send(session.status());
        }
        Command::SubscribeNotices(reply) => {
            let _ = reply.send(session.subscribe_notices());
        }
    }
}

async fn apply_track(session: &mut Session, track: LocalTrack) {
    if let Err(err) = session.set_master_track(track).await {
        error!(error = %err, "Failed to apply upstream master track");
    }
}

/// Next non-empty value of the feed; pends forever once the feed is gone
async fn next_track(feed: &mut Option<TrackFeed>) -> Option<LocalTrack> {
    let Some(rx) = feed.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        if let Some(track) = rx.borrow_and_update().clone() {
            return Some(track);
        }
    }
    debug!("Upstream track feed closed");
    *feed = None;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::media::LocalMedia;
    use crate::session::{SessionParams, SessionState};
    use crate::sync::LoopClock;
    use crate::test_helpers::{audio_track, FakeFactory, RecordingChannel};
    use std::sync::Arc;
    use std::time::Duration;

    fn driver(local: &str) -> (SessionDriver, mpsc::UnboundedSender<ChannelEvent>) {
        let channel = Arc::new(RecordingChannel::new(local));
        let (session, link_rx) = Session::new(SessionParams {
            username: local.to_string(),
            config: SessionConfig::default(),
            channel,
            connections: Arc::new(FakeFactory::new()),
            clock: Arc::new(LoopClock::default()),
            local_media: LocalMedia::default(),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (SessionDriver::new(session, link_rx, event_rx), event_tx)
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let (driver, _events) = driver("host");
        let (handle, task) = driver.spawn();

        assert!(matches!(handle.start_as_host().await, Err(Error::NoAudioSource)));
        handle.set_master_track(audio_track("A")).await.unwrap();
        handle.start_as_host().await.unwrap();
        assert_eq!(handle.status().await.unwrap().state, SessionState::Hosting);
        handle.clear_master_video().await.unwrap();
        assert!(matches!(handle.toggle_audio().await, Err(Error::NoLocalTrack(_))));

        handle.shutdown();
        let session = task.await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(handle.status().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_track_feed_replaces_master() {
        let (feed_tx, feed_rx) = watch::channel(None);
        let (driver, _events) = driver("host");
        let (handle, task) = driver.with_track_feed(feed_rx).spawn();

        feed_tx.send_replace(Some(audio_track("engine-1")));
        let mut ready = false;
        for _ in 0..50 {
            if handle.status().await.unwrap().master_ready {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ready);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_driver() {
        let cancel = CancellationToken::new();
        let (driver, _events) = driver("viewer");
        let (handle, task) = driver.with_cancellation(cancel.clone()).spawn();
        handle.start_as_viewer().await.unwrap();

        cancel.cancel();
        let session = task.await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(handle.is_closed());
    }
}
