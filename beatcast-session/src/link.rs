//! Peer links
//!
//! One [`PeerLink`] per remote participant wraps a [`PeerConnection`] and
//! drives the offer/answer/ICE exchange through an explicit state machine:
//!
//! ```text
//! NEW -> OFFER_SENT | OFFER_RECEIVED -> ANSWERED -> CONNECTED
//!   any state -> CLOSED
//! ```
//!
//! Renegotiation is a visible transition: a link that is `ANSWERED` or
//! `CONNECTED` goes back to `OFFER_SENT` when a sender is added or removed.
//! Remote ICE candidates that arrive before a remote description is set are
//! queued and applied in arrival order once it is.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::types::{ParticipantId, SenderId, TrackId, TrackKind};

/// A media connection to one remote participant
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Add an outbound sender carrying `track`
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId>;

    /// Swap the track of an existing sender in place
    async fn replace_track(&self, sender: &SenderId, track: &LocalTrack) -> Result<()>;

    /// Stop sending media on `sender` while keeping it negotiated
    async fn pause_sender(&self, sender: &SenderId) -> Result<()>;

    async fn remove_track(&self, sender: &SenderId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates connections; callbacks of the connection are reported through `events`
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn PeerConnection>>;
}

/// Which side sends the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    New,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl LinkState {
    #[must_use]
    pub const fn is_negotiating(&self) -> bool {
        matches!(self, Self::OfferSent | Self::OfferReceived | Self::Answered)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::OfferSent => "OFFER_SENT",
            Self::OfferReceived => "OFFER_RECEIVED",
            Self::Answered => "ANSWERED",
            Self::Connected => "CONNECTED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Transport-level connection state reported by the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// Incoming media announced by a connection
#[derive(Clone)]
pub struct RemoteMedia {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Underlying remote track, when the connection is a real WebRTC one
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Locally gathered ICE candidate to forward to the peer
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteMedia(RemoteMedia),
}

/// Callback from a connection, tagged with the link generation it belongs to
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Handed to a [`ConnectionFactory`] so connection callbacks reach the coordinator
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    #[must_use]
    pub fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { peer, generation, tx }
    }

    #[must_use]
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(LinkEventKind::LocalCandidate(candidate))
    }

    pub fn state_changed(&self, state: ConnectionState) -> bool {
        self.emit(LinkEventKind::StateChanged(state))
    }

    pub fn remote_media(&self, media: RemoteMedia) -> bool {
        self.emit(LinkEventKind::RemoteMedia(media))
    }

    /// Returns false once the coordinator is gone
    fn emit(&self, kind: LinkEventKind) -> bool {
        self.tx
            .send(LinkEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// Result of attaching a track to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachOutcome {
    /// The link already sends this track
    Unchanged,
    /// The existing sender of this kind now carries the track
    Replaced,
    /// A new sender was added; the link needs renegotiation
    Added,
}

impl AttachOutcome {
    #[must_use]
    pub const fn needs_renegotiation(&self) -> bool {
        matches!(self, Self::Added)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedSender {
    pub sender: SenderId,
    pub track_id: TrackId,
    /// Negotiated but sending nothing while its track is disabled
    pub paused: bool,
}

pub struct PeerLink {
    peer: ParticipantId,
    generation: u64,
    role: LinkRole,
    state: LinkState,
    state_since: Instant,
    connection: Arc<dyn PeerConnection>,
    /// At most one outbound sender per kind
    senders: HashMap<TrackKind, AttachedSender>,
    carries_master: bool,
    pending_candidates: VecDeque<IceCandidate>,
    max_pending_candidates: usize,
    has_remote_description: bool,
    transport_connected: bool,
    renegotiation_pending: bool,
    last_remote_sdp: Option<String>,
    offers_sent: u32,
    released: bool,
}

impl PeerLink {
    #[must_use]
    pub fn new(
        peer: ParticipantId,
        generation: u64,
        role: LinkRole,
        connection: Arc<dyn PeerConnection>,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            peer,
            generation,
            role,
            state: LinkState::New,
            state_since: Instant::now(),
            connection,
            senders: HashMap::new(),
            carries_master: false,
            pending_candidates: VecDeque::new(),
            max_pending_candidates,
            has_remote_description: false,
            transport_connected: false,
            renegotiation_pending: false,
            last_remote_sdp: None,
            offers_sent: 0,
            released: false,
        }
    }

    #[must_use]
    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn role(&self) -> LinkRole {
        self.role
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub const fn offers_sent(&self) -> u32 {
        self.offers_sent
    }

    #[must_use]
    pub const fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    #[must_use]
    pub const fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending
    }

    #[must_use]
    pub const fn carries_master(&self) -> bool {
        self.carries_master
    }

    pub fn set_carries_master(&mut self, carries: bool) {
        self.carries_master = carries;
    }

    #[must_use]
    pub fn sender(&self, kind: TrackKind) -> Option<&AttachedSender> {
        self.senders.get(&kind)
    }

    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// A link that has been negotiating without a transport connection for too long
    #[must_use]
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.state.is_negotiating()
            && !self.transport_connected
            && self.state_since.elapsed() >= timeout
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state != next {
            debug!(
                peer_id = %self.peer,
                generation = self.generation,
                from = %self.state,
                to = %next,
                "Link state transition"
            );
            self.state = next;
            self.state_since = Instant::now();
        }
    }

    /// Settle after a completed offer/answer round
    fn settle(&mut self) {
        if self.transport_connected {
            self.set_state(LinkState::Connected);
        } else {
            self.set_state(LinkState::Answered);
        }
    }

    /// Kick off negotiation; an initiator returns the offer to send
    pub async fn start(&mut self) -> Result<Option<SessionDescription>> {
        if self.role == LinkRole::Initiator && self.state == LinkState::New {
            return self.send_offer().await.map(Some);
        }
        Ok(None)
    }

    async fn send_offer(&mut self) -> Result<SessionDescription> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.offers_sent += 1;
        self.set_state(LinkState::OfferSent);
        Ok(offer)
    }

    /// Apply a remote offer; returns the answer to send
    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<Option<SessionDescription>> {
        match self.state {
            LinkState::New | LinkState::Answered | LinkState::Connected => {}
            LinkState::OfferSent | LinkState::OfferReceived => {
                debug!(
                    peer_id = %self.peer,
                    state = %self.state,
                    "Ignoring offer while our own negotiation is in flight"
                );
                return Ok(None);
            }
            LinkState::Closed => return Ok(None),
        }
        if self.last_remote_sdp.as_deref() == Some(offer.sdp.as_str()) {
            debug!(peer_id = %self.peer, "Ignoring repeated offer");
            return Ok(None);
        }

        self.set_state(LinkState::OfferReceived);
        let sdp = offer.sdp.clone();
        self.connection.set_remote_description(offer).await?;
        self.last_remote_sdp = Some(sdp);
        self.has_remote_description = true;
        self.flush_candidates().await;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.settle();
        Ok(Some(answer))
    }

    /// Apply a remote answer; returns a follow-up offer when a renegotiation was queued
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<Option<SessionDescription>> {
        if self.state != LinkState::OfferSent {
            debug!(
                peer_id = %self.peer,
                state = %self.state,
                "Ignoring answer outside OFFER_SENT"
            );
            return Ok(None);
        }

        let sdp = answer.sdp.clone();
        self.connection.set_remote_description(answer).await?;
        self.last_remote_sdp = Some(sdp);
        self.has_remote_description = true;
        self.flush_candidates().await;
        self.settle();

        if self.renegotiation_pending {
            self.renegotiation_pending = false;
            return self.send_offer().await.map(Some);
        }
        Ok(None)
    }

    /// Apply a remote candidate now, or queue it until a remote description exists
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        if !self.has_remote_description {
            self.queue_candidate(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    /// Queue candidates that arrived before this link existed
    pub fn queue_candidates(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        for candidate in candidates {
            self.queue_candidate(candidate);
        }
    }

    fn queue_candidate(&mut self, candidate: IceCandidate) {
        if self.max_pending_candidates > 0 && self.pending_candidates.len() >= self.max_pending_candidates {
            warn!(
                peer_id = %self.peer,
                queued = self.pending_candidates.len(),
                "Pending ICE candidate queue full, dropping candidate"
            );
            return;
        }
        self.pending_candidates.push_back(candidate);
    }

    async fn flush_candidates(&mut self) {
        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.peer, error = %err, "Failed to apply queued ICE candidate");
            }
        }
        if queued > 0 {
            debug!(peer_id = %self.peer, count = queued, "Applied queued ICE candidates");
        }
    }

    /// Send `track` on this link: no-op for the same track, in-place replace
    /// for another track of the same kind, new sender otherwise
    ///
    /// A disabled track is attached with its sender paused.
    pub async fn attach_track(&mut self, track: &LocalTrack) -> Result<AttachOutcome> {
        if self.state == LinkState::Closed {
            return Err(Error::Transport(format!("link to {} is closed", self.peer)));
        }

        if let Some(attached) = self.senders.get(&track.kind()) {
            if attached.track_id == *track.id() {
                return Ok(AttachOutcome::Unchanged);
            }
            let sender = attached.sender;
            let old_track = attached.track_id.clone();
            let paused = self.apply_track(sender, track).await?;
            self.senders.insert(
                track.kind(),
                AttachedSender {
                    sender,
                    track_id: track.id().clone(),
                    paused,
                },
            );
            debug!(
                peer_id = %self.peer,
                kind = %track.kind(),
                old_track = %old_track,
                new_track = %track.id(),
                paused,
                "Replaced outbound track in place"
            );
            return Ok(AttachOutcome::Replaced);
        }

        let sender = self.connection.add_track(track).await?;
        let paused = !track.is_enabled();
        if paused {
            self.connection.pause_sender(&sender).await?;
        }
        self.senders.insert(
            track.kind(),
            AttachedSender {
                sender,
                track_id: track.id().clone(),
                paused,
            },
        );
        debug!(
            peer_id = %self.peer,
            kind = %track.kind(),
            track_id = %track.id(),
            sender = %sender,
            paused,
            "Added outbound sender"
        );
        Ok(AttachOutcome::Added)
    }

    /// Put `track` on `sender`, or pause the sender if the track is disabled
    async fn apply_track(&self, sender: SenderId, track: &LocalTrack) -> Result<bool> {
        if track.is_enabled() {
            self.connection.replace_track(&sender, track).await?;
            Ok(false)
        } else {
            self.connection.pause_sender(&sender).await?;
            Ok(true)
        }
    }

    /// Follow the enabled flag of `track` on the sender carrying it
    ///
    /// Returns true when the sender was paused or resumed. Links that do not
    /// send `track` are left alone.
    pub async fn sync_track_enabled(&mut self, track: &LocalTrack) -> Result<bool> {
        if self.state == LinkState::Closed {
            return Ok(false);
        }
        let Some(attached) = self.senders.get(&track.kind()) else {
            return Ok(false);
        };
        if attached.track_id != *track.id() || attached.paused != track.is_enabled() {
            return Ok(false);
        }

        let sender = attached.sender;
        let paused = self.apply_track(sender, track).await?;
        if let Some(attached) = self.senders.get_mut(&track.kind()) {
            attached.paused = paused;
        }
        debug!(
            peer_id = %self.peer,
            track_id = %track.id(),
            paused,
            "Outbound sender toggled"
        );
        Ok(true)
    }

    /// Remove the sender of `kind`; true if one was removed and the link
    /// needs renegotiation
    pub async fn detach_track(&mut self, kind: TrackKind) -> Result<bool> {
        if self.state == LinkState::Closed {
            return Ok(false);
        }
        let Some(attached) = self.senders.remove(&kind) else {
            return Ok(false);
        };
        self.connection.remove_track(&attached.sender).await?;
        debug!(
            peer_id = %self.peer,
            kind = %kind,
            track_id = %attached.track_id,
            sender = %attached.sender,
            "Removed outbound sender"
        );
        Ok(true)
    }

    /// Start a new offer/answer round after the set of senders changed
    ///
    /// Returns the offer to send. A round already in flight is marked so that
    /// exactly one follow-up offer goes out once its answer arrives.
    pub async fn renegotiate(&mut self) -> Result<Option<SessionDescription>> {
        match self.state {
            // The first offer carries every attached sender
            LinkState::New | LinkState::Closed => Ok(None),
            LinkState::OfferSent | LinkState::OfferReceived => {
                self.renegotiation_pending = true;
                Ok(None)
            }
            LinkState::Answered | LinkState::Connected => {
                info!(peer_id = %self.peer, generation = self.generation, "Renegotiating link");
                self.send_offer().await.map(Some)
            }
        }
    }

    /// Fold a transport state report into the link state
    pub fn on_transport_state(&mut self, state: ConnectionState) -> LinkState {
        match state {
            ConnectionState::Connected => {
                self.transport_connected = true;
                if self.state == LinkState::Answered {
                    self.set_state(LinkState::Connected);
                }
            }
            ConnectionState::Disconnected => {
                debug!(peer_id = %self.peer, "Transport disconnected, waiting for recovery");
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                self.transport_connected = false;
                self.set_state(LinkState::Closed);
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
        self.state
    }

    /// Close the connection; returns false if it was already released
    pub async fn close(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.set_state(LinkState::Closed);
        self.pending_candidates.clear();
        self.senders.clear();
        self.carries_master = false;
        if let Err(err) = self.connection.close().await {
            warn!(peer_id = %self.peer, error = %err, "Error while closing connection");
        }
        true
    }
}
