//! webrtc-rs implementation of the connection seam

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::WebRtcConfig;
use crate::error::{Error, Result};
use crate::link::{ConnectionFactory, ConnectionState, LinkEventSink, PeerConnection, RemoteMedia};
use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{SenderId, TrackKind};

/// Builds webrtc-rs peer connections sharing one media engine
pub struct WebRtcConnectionFactory {
    api: API,
    configuration: RTCConfiguration,
}

impl WebRtcConnectionFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            configuration: rtc_configuration(config),
        })
    }
}

fn rtc_configuration(config: &WebRtcConfig) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    if !config.stun_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    if let Some(url) = &config.turn_server_url {
        ice_servers.push(RTCIceServer {
            urls: vec![url.clone()],
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(self.api.new_peer_connection(self.configuration.clone()).await?);

        let sink = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.ice_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(err) => {
                        warn!(peer_id = %sink.peer(), error = %err, "Failed to serialize local ICE candidate");
                    }
                }
            })
        }));

        let sink = events.clone();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer_id = %sink.peer(), state = %state, "Peer connection state changed");
            sink.state_changed(ConnectionState::from(state));
            Box::pin(async {})
        }));

        let sink = events;
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                sink.remote_media(RemoteMedia {
                    track_id: track.id().to_string(),
                    stream_id: track.stream_id().to_string(),
                    kind: TrackKind::from(track.kind()),
                    track: Some(track),
                });
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcPeer::new(connection)))
    }
}

/// One `RTCPeerConnection` plus the senders it owns
pub struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcPeer {
    #[must_use]
    pub fn new(connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            connection,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }
    }

    fn sender(&self, id: &SenderId) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown sender {id}")))
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let desc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(desc)
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.connection.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.connection.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let rtp_sender = self.connection.add_track(track.media()).await?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(id, rtp_sender);
        Ok(id)
    }

    async fn replace_track(&self, sender: &SenderId, track: &LocalTrack) -> Result<()> {
        let rtp_sender = self.sender(sender)?;
        rtp_sender.replace_track(Some(track.media())).await?;
        Ok(())
    }

    async fn pause_sender(&self, sender: &SenderId) -> Result<()> {
        let rtp_sender = self.sender(sender)?;
        rtp_sender.replace_track(None).await?;
        Ok(())
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<()> {
        let rtp_sender = self.sender(sender)?;
        self.connection.remove_track(&rtp_sender).await?;
        self.senders.lock().remove(sender);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.connection.close().await?;
        Ok(())
    }
}
