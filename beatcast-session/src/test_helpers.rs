//! Shared fakes for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::channel::SessionChannel;
use crate::error::{Error, Result};
use crate::link::{ConnectionFactory, ConnectionState, LinkEventSink, PeerConnection};
use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, PresencePayload, SdpKind, SessionDescription, SignalEnvelope};
use crate::types::{ParticipantId, SenderId, SessionId, TrackId, TrackKind};

/// Channel that records what the local participant publishes
pub struct RecordingChannel {
    session_id: SessionId,
    local_id: ParticipantId,
    published: Mutex<Vec<SignalEnvelope>>,
    presence: Mutex<Option<PresencePayload>>,
}

impl RecordingChannel {
    pub fn new(local: &str) -> Self {
        Self {
            session_id: SessionId::from("test-session"),
            local_id: ParticipantId::from(local),
            published: Mutex::new(Vec::new()),
            presence: Mutex::new(None),
        }
    }

    pub fn published(&self) -> Vec<SignalEnvelope> {
        self.published.lock().clone()
    }

    /// Drain and return what was published so far
    pub fn take_published(&self) -> Vec<SignalEnvelope> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn presence(&self) -> Option<PresencePayload> {
        self.presence.lock().clone()
    }
}

#[async_trait]
impl SessionChannel for RecordingChannel {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    async fn track(&self, presence: &PresencePayload) -> Result<()> {
        *self.presence.lock() = Some(presence.clone());
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        *self.presence.lock() = None;
        Ok(())
    }

    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()> {
        self.published.lock().push(envelope.clone());
        Ok(())
    }
}

/// One recorded call on a [`FakeConnection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    AddTrack(TrackId),
    ReplaceTrack(SenderId, TrackId),
    PauseSender(SenderId),
    RemoveTrack(SenderId),
    Close,
}

/// In-memory connection that records calls and tracks active senders
///
/// A paused sender stays in the sender table with no track.
pub struct FakeConnection {
    sink: Option<LinkEventSink>,
    calls: Mutex<Vec<Call>>,
    senders: Mutex<HashMap<SenderId, (TrackKind, Option<TrackId>)>>,
    next_sender: AtomicU64,
    next_sdp: AtomicU64,
    max_audio_senders: AtomicUsize,
    fail_remote: AtomicBool,
}

impl FakeConnection {
    pub fn new(sink: Option<LinkEventSink>) -> Self {
        Self {
            sink,
            calls: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            next_sdp: AtomicU64::new(1),
            max_audio_senders: AtomicUsize::new(0),
            fail_remote: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Tracks currently sent on audio senders
    pub fn audio_tracks(&self) -> Vec<TrackId> {
        self.sending(TrackKind::Audio)
    }

    /// Tracks currently sent on video senders
    pub fn video_tracks(&self) -> Vec<TrackId> {
        self.sending(TrackKind::Video)
    }

    fn sending(&self, kind: TrackKind) -> Vec<TrackId> {
        self.senders
            .lock()
            .values()
            .filter(|(k, _)| *k == kind)
            .filter_map(|(_, id)| id.clone())
            .collect()
    }

    /// Senders of `kind`, paused ones included
    pub fn sender_count(&self, kind: TrackKind) -> usize {
        self.senders.lock().values().filter(|(k, _)| *k == kind).count()
    }

    /// Highest number of simultaneously active audio senders ever seen
    pub fn max_audio_senders(&self) -> usize {
        self.max_audio_senders.load(Ordering::SeqCst)
    }

    pub fn fail_set_remote(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Simulate a transport state callback
    pub fn emit_state(&self, state: ConnectionState) {
        if let Some(sink) = &self.sink {
            sink.state_changed(state);
        }
    }

    /// Simulate a locally gathered candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        if let Some(sink) = &self.sink {
            sink.ice_candidate(candidate);
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn sdp(&self, kind: &str) -> String {
        let n = self.next_sdp.fetch_add(1, Ordering::SeqCst);
        format!("v=0 {kind}-{n}-{}", nanoid::nanoid!(6))
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetRemote(desc.kind));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("remote description rejected".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        self.record(Call::AddTrack(track.id().clone()));
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        let mut senders = self.senders.lock();
        senders.insert(id, (track.kind(), Some(track.id().clone())));
        let audio = senders.values().filter(|(kind, _)| *kind == TrackKind::Audio).count();
        self.max_audio_senders.fetch_max(audio, Ordering::SeqCst);
        Ok(id)
    }

    async fn replace_track(&self, sender: &SenderId, track: &LocalTrack) -> Result<()> {
        self.record(Call::ReplaceTrack(*sender, track.id().clone()));
        let mut senders = self.senders.lock();
        let entry = senders
            .get_mut(sender)
            .ok_or_else(|| Error::Transport(format!("unknown sender {sender}")))?;
        entry.1 = Some(track.id().clone());
        Ok(())
    }

    async fn pause_sender(&self, sender: &SenderId) -> Result<()> {
        self.record(Call::PauseSender(*sender));
        let mut senders = self.senders.lock();
        let entry = senders
            .get_mut(sender)
            .ok_or_else(|| Error::Transport(format!("unknown sender {sender}")))?;
        entry.1 = None;
        Ok(())
    }

    async fn remove_track(&self, sender: &SenderId) -> Result<()> {
        self.record(Call::RemoveTrack(*sender));
        self.senders.lock().remove(sender);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        self.senders.lock().clear();
        Ok(())
    }
}

/// Factory handing out [`FakeConnection`]s and remembering them per peer
#[derive(Default)]
pub struct FakeFactory {
    connections: Mutex<Vec<(ParticipantId, Arc<FakeConnection>)>>,
    fail_next: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest connection created for `peer`
    pub fn connection(&self, peer: &str) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == peer)
            .map(|(_, c)| Arc::clone(c))
    }

    pub fn connections_for(&self, peer: &str) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() == peer)
            .count()
    }

    pub fn total(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn PeerConnection>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::WebRtc("connection refused".to_string()));
        }
        let peer = events.peer().clone();
        let connection = Arc::new(FakeConnection::new(Some(events)));
        self.connections.lock().push((peer, Arc::clone(&connection)));
        Ok(connection)
    }
}

fn sample_track(mime_type: &str, id: &str, stream_id: &str) -> LocalTrack {
    LocalTrack::new(Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_string(),
        stream_id.to_string(),
    )))
}

pub fn audio_track(id: &str) -> LocalTrack {
    sample_track(MIME_TYPE_OPUS, id, "test-stream")
}

pub fn video_track(id: &str) -> LocalTrack {
    sample_track(MIME_TYPE_VP8, id, "test-stream")
}
