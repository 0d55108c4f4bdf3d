//! Session coordinator
//!
//! Owns the roster, the signal router, the master source and the peer link
//! table. Every input (presence events, signal envelopes, connection
//! callbacks, API calls) is applied here one at a time, so the link table has
//! a single writer and needs no locking.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, SessionChannel};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::link::{
    ConnectionFactory, LinkEvent, LinkEventKind, LinkEventSink, LinkRole, LinkState, PeerLink, RemoteMedia,
};
use crate::media::{LocalMedia, LocalTrack, MasterSource};
use crate::presence::{Participant, PresenceTracker, RosterDelta};
use crate::protocol::{IceCandidate, InboundSignal, PresencePayload, SessionDescription, Signal, SignalEnvelope, SignalKind, SyncSnapshot};
use crate::signal::SignalRouter;
use crate::sync::{validate_snapshot, PlaybackClock};
use crate::types::{ParticipantId, Role, SessionId, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Hosting,
    Viewing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Hosting => f.write_str("hosting"),
            Self::Viewing => f.write_str("viewing"),
        }
    }
}

/// Notifications for the embedding application
#[derive(Debug, Clone)]
pub enum SessionNotice {
    StateChanged(SessionState),
    LinkStateChanged {
        peer: ParticipantId,
        state: LinkState,
    },
    RemoteMedia {
        peer: ParticipantId,
        media: RemoteMedia,
    },
    SyncApplied {
        from: ParticipantId,
        snapshot: SyncSnapshot,
    },
    /// Non-fatal problem, usually a failed negotiation
    Warning {
        peer: Option<ParticipantId>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub peer: ParticipantId,
    pub generation: u64,
    pub role: LinkRole,
    pub state: LinkState,
    pub senders: usize,
    pub offers_sent: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub local_id: ParticipantId,
    pub state: SessionState,
    pub roster_size: usize,
    pub master_ready: bool,
    pub links: Vec<LinkStatus>,
}

/// Everything a [`Session`] is built from
pub struct SessionParams {
    pub username: String,
    pub config: SessionConfig,
    pub channel: Arc<dyn SessionChannel>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub clock: Arc<dyn PlaybackClock>,
    pub local_media: LocalMedia,
}

pub struct Session {
    session_id: SessionId,
    local_id: ParticipantId,
    username: String,
    config: SessionConfig,
    state: SessionState,
    presence: PresenceTracker,
    router: SignalRouter,
    connections: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn PlaybackClock>,
    local_media: LocalMedia,
    master: MasterSource,
    links: HashMap<ParticipantId, PeerLink>,
    /// Remote candidates for participants that have no link yet
    orphan_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    /// Participants whose link was torn down and not yet replaced
    closed_peers: HashSet<ParticipantId>,
    next_generation: u64,
    awaiting_sync: bool,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    notices: Vec<mpsc::UnboundedSender<SessionNotice>>,
}

impl Session {
    /// Build an idle session; connection callbacks arrive on the returned receiver
    pub fn new(params: SessionParams) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let session_id = params.channel.session_id().clone();
        let local_id = params.channel.local_id().clone();
        let router = SignalRouter::new(Arc::clone(&params.channel), params.config.dedup_window());

        let session = Self {
            session_id,
            presence: PresenceTracker::new(local_id.clone()),
            local_id,
            username: params.username,
            config: params.config,
            state: SessionState::Idle,
            router,
            connections: params.connections,
            clock: params.clock,
            local_media: params.local_media,
            master: MasterSource::new(),
            links: HashMap::new(),
            orphan_candidates: HashMap::new(),
            closed_peers: HashSet::new(),
            next_generation: 0,
            awaiting_sync: false,
            link_tx,
            notices: Vec::new(),
        };
        (session, link_rx)
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn master(&self) -> &MasterSource {
        &self.master
    }

    #[must_use]
    pub fn link(&self, peer: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let mut links: Vec<LinkStatus> = self
            .links
            .values()
            .map(|link| LinkStatus {
                peer: link.peer().clone(),
                generation: link.generation(),
                role: link.role(),
                state: link.state(),
                senders: link.sender_count(),
                offers_sent: link.offers_sent(),
            })
            .collect();
        links.sort_by(|a, b| a.peer.cmp(&b.peer));

        SessionStatus {
            session_id: self.session_id.clone(),
            local_id: self.local_id.clone(),
            state: self.state,
            roster_size: self.presence.len(),
            master_ready: self.master.is_ready(),
            links,
        }
    }

    pub fn subscribe_notices(&mut self) -> mpsc::UnboundedReceiver<SessionNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notices.push(tx);
        rx
    }

    /// Observe accepted envelopes of one kind
    pub fn on_signal<F>(&mut self, kind: SignalKind, handler: F)
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        self.router.on_receive(kind, handler);
    }

    fn notify(&mut self, notice: SessionNotice) {
        self.notices.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    fn warn_notice(&mut self, peer: Option<&ParticipantId>, message: String) {
        self.notify(SessionNotice::Warning {
            peer: peer.cloned(),
            message,
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!(
                session_id = %self.session_id,
                from = %self.state,
                to = %state,
                "Session state changed"
            );
            self.state = state;
            self.notify(SessionNotice::StateChanged(state));
        }
    }

    fn presence_payload(&self, role: Role, streaming: bool) -> PresencePayload {
        PresencePayload {
            user_id: self.local_id.clone(),
            username: self.username.clone(),
            role,
            streaming,
        }
    }

    /// Start broadcasting the master source to every viewer in the roster
    pub async fn start_as_host(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::AlreadyActive(self.state));
        }
        if !self.master.is_ready() {
            return Err(Error::NoAudioSource);
        }

        let payload = self.presence_payload(Role::Host, true);
        self.router.channel().track(&payload).await?;
        self.set_state(SessionState::Hosting);

        let viewers: Vec<ParticipantId> = self.presence.viewers().map(|p| p.id.clone()).collect();
        info!(
            session_id = %self.session_id,
            viewers = viewers.len(),
            "Hosting started"
        );
        for viewer in viewers {
            self.open_link(&viewer, LinkRole::Initiator).await;
        }
        Ok(())
    }

    /// Join as a viewer and ask any streaming host for its playback position
    pub async fn start_as_viewer(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::AlreadyActive(self.state));
        }

        let payload = self.presence_payload(Role::Viewer, false);
        self.router.channel().track(&payload).await?;
        self.set_state(SessionState::Viewing);
        info!(session_id = %self.session_id, "Viewing started");

        self.request_sync().await;
        Ok(())
    }

    /// Close every link, drop the master source and withdraw presence
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Ok(());
        }

        let peers: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for peer in &peers {
            self.teardown_link(peer, "session stopped").await;
        }
        self.orphan_candidates.clear();
        self.closed_peers.clear();
        self.master.clear();
        self.awaiting_sync = false;
        self.set_state(SessionState::Idle);

        info!(session_id = %self.session_id, links_closed = peers.len(), "Session stopped");
        self.router.channel().untrack().await
    }

    /// Mute or unmute the local microphone on every link sending it
    pub async fn toggle_audio(&mut self) -> Result<bool> {
        self.toggle_local(TrackKind::Audio).await
    }

    /// Switch the local camera off or back on for every link sending it
    pub async fn toggle_video(&mut self) -> Result<bool> {
        self.toggle_local(TrackKind::Video).await
    }

    async fn toggle_local(&mut self, kind: TrackKind) -> Result<bool> {
        let enabled = self.local_media.toggle(kind)?;
        let Some(track) = self.local_media.track(kind).cloned() else {
            return Ok(enabled);
        };

        let mut failed = Vec::new();
        let mut changed = 0usize;
        for link in self.links.values_mut() {
            match link.sync_track_enabled(&track).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(err) => failed.push((link.peer().clone(), err)),
            }
        }
        debug!(kind = %kind, enabled, links = changed, "Local track toggled on links");
        for (peer, err) in failed {
            self.fail_link(&peer, err).await;
        }
        Ok(enabled)
    }

    /// Install or swap a master track
    ///
    /// While hosting, every link already carrying the master is updated in
    /// place before any renegotiation offer goes out.
    pub async fn set_master_track(&mut self, track: LocalTrack) -> Result<()> {
        info!(
            session_id = %self.session_id,
            track_id = %track.id(),
            kind = %track.kind(),
            "Master track set"
        );
        if self.state != SessionState::Hosting {
            self.master.set(track);
            return Ok(());
        }

        let results = self.master.replace(track, self.links.values_mut()).await;
        for (peer, result) in results {
            match result {
                Ok(outcome) if outcome.needs_renegotiation() => self.renegotiate(&peer).await,
                Ok(_) => {}
                Err(err) => self.fail_link(&peer, err).await,
            }
        }
        Ok(())
    }

    /// Stop broadcasting master video
    ///
    /// While hosting, links carrying the master fall back to the local camera
    /// in place when there is one; otherwise their video sender is removed
    /// and the link renegotiates.
    pub async fn clear_master_video(&mut self) -> Result<()> {
        let Some(previous) = self.master.clear_video() else {
            return Ok(());
        };
        info!(session_id = %self.session_id, track_id = %previous.id(), "Master video cleared");
        if self.state != SessionState::Hosting {
            return Ok(());
        }

        let camera = self.local_media.camera.clone();
        let mut results = Vec::new();
        for link in self.links.values_mut().filter(|link| link.carries_master()) {
            let result = match &camera {
                Some(camera) => link.attach_track(camera).await.map(|outcome| outcome.needs_renegotiation()),
                None => link.detach_track(TrackKind::Video).await,
            };
            results.push((link.peer().clone(), result));
        }
        for (peer, result) in results {
            match result {
                Ok(true) => self.renegotiate(&peer).await,
                Ok(false) => {}
                Err(err) => self.fail_link(&peer, err).await,
            }
        }
        Ok(())
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        debug!(event_type = event.event_type(), "Channel event");
        match event {
            ChannelEvent::PresenceSync(entries) => {
                let delta = self.presence.sync(&entries);
                self.apply_roster_delta(delta).await;
            }
            ChannelEvent::PresenceJoin(entries) => {
                let delta = self.presence.join(&entries);
                self.apply_roster_delta(delta).await;
            }
            ChannelEvent::PresenceLeave(entries) => {
                let delta = self.presence.leave(&entries);
                self.apply_roster_delta(delta).await;
            }
            ChannelEvent::Signal(envelope) => {
                if let Some(inbound) = self.router.accept(&envelope) {
                    self.handle_signal(inbound).await;
                }
            }
        }
    }

    async fn apply_roster_delta(&mut self, delta: RosterDelta) {
        if delta.is_empty() {
            return;
        }
        for participant in &delta.left {
            self.orphan_candidates.remove(&participant.id);
            self.teardown_link(&participant.id, "participant left").await;
        }
        for participant in delta.joined.iter().chain(delta.updated.iter()) {
            self.reconcile(participant, true).await;
        }
        for id in &delta.repeated {
            self.reset_if_stalled(id).await;
            if let Some(participant) = self.presence.get(id).cloned() {
                self.reconcile(&participant, false).await;
            }
        }
    }

    /// Bring the link for `participant` in line with its role and our state
    async fn reconcile(&mut self, participant: &Participant, announced: bool) {
        let has_link = self.links.contains_key(&participant.id);
        match self.state {
            SessionState::Idle => {}
            SessionState::Hosting => match participant.role {
                Role::Viewer if !has_link => {
                    self.open_link(&participant.id, LinkRole::Initiator).await;
                }
                Role::Host if has_link => {
                    self.teardown_link(&participant.id, "participant is a host").await;
                }
                _ => {}
            },
            SessionState::Viewing => {
                if participant.is_streaming_host() {
                    if !has_link {
                        self.open_link(&participant.id, LinkRole::Responder).await;
                    }
                    if announced {
                        self.request_sync().await;
                    }
                } else if participant.role == Role::Host && has_link {
                    self.teardown_link(&participant.id, "host stopped streaming").await;
                }
            }
        }
    }

    async fn reset_if_stalled(&mut self, peer: &ParticipantId) {
        let timeout = self.config.negotiation_timeout();
        let stalled = self.links.get(peer).is_some_and(|link| link.is_stalled(timeout));
        if stalled {
            info!(peer_id = %peer, "Repeated join for stalled link, resetting");
            self.teardown_link(peer, "negotiation stalled").await;
        }
    }

    async fn open_link(&mut self, peer: &ParticipantId, role: LinkRole) {
        if let Err(err) = self.try_open_link(peer, role).await {
            warn!(peer_id = %peer, error = %err, "Failed to open peer link");
            self.warn_notice(Some(peer), format!("failed to open link: {err}"));
        }
    }

    async fn try_open_link(&mut self, peer: &ParticipantId, role: LinkRole) -> Result<()> {
        if self.links.contains_key(peer) {
            return Ok(());
        }
        if self.config.max_links > 0 && self.links.len() >= self.config.max_links {
            return Err(Error::LinkLimit(self.config.max_links));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = LinkEventSink::new(peer.clone(), generation, self.link_tx.clone());
        let connection = self.connections.connect(sink).await?;

        let mut link = PeerLink::new(
            peer.clone(),
            generation,
            role,
            connection,
            self.config.max_pending_candidates,
        );
        if let Some(candidates) = self.orphan_candidates.remove(peer) {
            link.queue_candidates(candidates);
        }

        let offer = match self.prepare_link(&mut link).await {
            Ok(offer) => offer,
            Err(err) => {
                link.close().await;
                return Err(err);
            }
        };

        info!(
            peer_id = %peer,
            generation,
            role = ?role,
            state = %link.state(),
            "Peer link created"
        );
        let state = link.state();
        self.links.insert(peer.clone(), link);
        self.closed_peers.remove(peer);
        self.notify(SessionNotice::LinkStateChanged {
            peer: peer.clone(),
            state,
        });

        if let Some(offer) = offer {
            self.send_to(peer, Signal::Offer(offer)).await;
        }
        Ok(())
    }

    /// Attach media and produce the initiator's first offer
    async fn prepare_link(&self, link: &mut PeerLink) -> Result<Option<SessionDescription>> {
        if self.state == SessionState::Hosting && link.role() == LinkRole::Initiator {
            self.master.attach(link).await?;
        }
        for track in self.local_media.tracks() {
            if link.sender(track.kind()).is_none() {
                link.attach_track(track).await?;
            }
        }
        link.start().await
    }

    async fn handle_signal(&mut self, inbound: InboundSignal) {
        let InboundSignal { from, signal } = inbound;
        match signal {
            Signal::Offer(offer) => self.handle_offer(&from, offer).await,
            Signal::Answer(answer) => self.handle_answer(&from, answer).await,
            Signal::IceCandidate(candidate) => self.handle_remote_candidate(&from, candidate).await,
            Signal::SyncRequest => self.handle_sync_request(&from).await,
            Signal::SyncResponse(snapshot) => self.handle_sync_response(&from, &snapshot),
        }
    }

    async fn handle_offer(&mut self, from: &ParticipantId, offer: SessionDescription) {
        match self.state {
            SessionState::Idle => {
                debug!(from = %from, "Offer while idle ignored");
                return;
            }
            SessionState::Hosting => {
                debug!(from = %from, "Offer while hosting ignored, the host initiates every link");
                return;
            }
            SessionState::Viewing => {}
        }
        if !self.links.contains_key(from) {
            self.open_link(from, LinkRole::Responder).await;
        }
        let Some(link) = self.links.get_mut(from) else {
            return;
        };

        let before = link.state();
        let result = link.handle_offer(offer).await;
        let after = link.state();
        match result {
            Ok(answer) => {
                self.link_state_notice(from, before, after);
                if let Some(answer) = answer {
                    self.send_to(from, Signal::Answer(answer)).await;
                }
            }
            Err(err) => self.fail_link(from, err).await,
        }
    }

    async fn handle_answer(&mut self, from: &ParticipantId, answer: SessionDescription) {
        let Some(link) = self.links.get_mut(from) else {
            debug!(from = %from, "Answer for unknown link ignored");
            return;
        };

        let before = link.state();
        let result = link.handle_answer(answer).await;
        let after = link.state();
        match result {
            Ok(follow_up) => {
                self.link_state_notice(from, before, after);
                if let Some(offer) = follow_up {
                    self.send_to(from, Signal::Offer(offer)).await;
                }
            }
            Err(err) => self.fail_link(from, err).await,
        }
    }

    async fn handle_remote_candidate(&mut self, from: &ParticipantId, candidate: IceCandidate) {
        if let Some(link) = self.links.get_mut(from) {
            if let Err(err) = link.add_remote_candidate(candidate).await {
                warn!(peer_id = %from, error = %err, "Failed to apply remote ICE candidate");
            }
            return;
        }
        if self.state == SessionState::Idle {
            return;
        }
        if self.closed_peers.contains(from) {
            debug!(peer_id = %from, "Candidate for a torn-down link ignored");
            return;
        }

        let limit = self.config.max_pending_candidates;
        let queue = self.orphan_candidates.entry(from.clone()).or_default();
        if limit > 0 && queue.len() >= limit {
            warn!(peer_id = %from, queued = queue.len(), "Orphan ICE queue full, dropping candidate");
            return;
        }
        queue.push(candidate);
        debug!(peer_id = %from, queued = queue.len(), "Queued ICE candidate for unknown link");
    }

    async fn handle_sync_request(&mut self, from: &ParticipantId) {
        if self.state != SessionState::Hosting {
            debug!(from = %from, "Sync request while not hosting ignored");
            return;
        }
        let snapshot = self.clock.snapshot();
        info!(
            to = %from,
            current_time = snapshot.current_time,
            is_playing = snapshot.is_playing,
            "Answering sync request"
        );
        self.send_to(from, Signal::SyncResponse(snapshot)).await;
    }

    fn handle_sync_response(&mut self, from: &ParticipantId, snapshot: &SyncSnapshot) {
        if self.state != SessionState::Viewing || !self.awaiting_sync {
            debug!(from = %from, "Unsolicited sync response ignored");
            return;
        }
        if let Err(err) = validate_snapshot(snapshot) {
            warn!(from = %from, error = %err, "Rejecting sync response");
            return;
        }

        self.clock.apply(snapshot);
        self.awaiting_sync = false;
        info!(
            from = %from,
            current_time = snapshot.current_time,
            loop_duration = snapshot.loop_duration,
            is_playing = snapshot.is_playing,
            "Playback synced to host"
        );
        self.notify(SessionNotice::SyncApplied {
            from: from.clone(),
            snapshot: *snapshot,
        });
    }

    async fn request_sync(&mut self) {
        self.awaiting_sync = true;
        if let Err(err) = self.router.send_signal(None, &Signal::SyncRequest).await {
            warn!(error = %err, "Failed to send sync request");
            self.warn_notice(None, format!("sync request failed: {err}"));
        }
    }

    /// Apply a connection callback to the link that produced it
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent { peer, generation, kind } = event;
        let Some(link) = self.links.get_mut(&peer) else {
            debug!(peer_id = %peer, generation, "Event for removed link ignored");
            return;
        };
        if link.generation() != generation {
            debug!(
                peer_id = %peer,
                generation,
                current = link.generation(),
                "Event from stale link generation ignored"
            );
            return;
        }

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                self.send_to(&peer, Signal::IceCandidate(candidate)).await;
            }
            LinkEventKind::StateChanged(transport) => {
                let before = link.state();
                let after = link.on_transport_state(transport);
                if after == LinkState::Closed {
                    warn!(peer_id = %peer, transport = ?transport, "Transport failed, closing link");
                    self.teardown_link(&peer, "transport failed").await;
                    self.warn_notice(Some(&peer), format!("connection {transport:?}"));
                } else {
                    self.link_state_notice(&peer, before, after);
                }
            }
            LinkEventKind::RemoteMedia(media) => {
                info!(
                    peer_id = %peer,
                    kind = %media.kind,
                    track_id = %media.track_id,
                    "Remote media arrived"
                );
                self.notify(SessionNotice::RemoteMedia { peer, media });
            }
        }
    }

    fn link_state_notice(&mut self, peer: &ParticipantId, before: LinkState, after: LinkState) {
        if before != after {
            self.notify(SessionNotice::LinkStateChanged {
                peer: peer.clone(),
                state: after,
            });
        }
    }

    async fn renegotiate(&mut self, peer: &ParticipantId) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        let before = link.state();
        let result = link.renegotiate().await;
        let after = link.state();
        match result {
            Ok(offer) => {
                self.link_state_notice(peer, before, after);
                if let Some(offer) = offer {
                    self.send_to(peer, Signal::Offer(offer)).await;
                }
            }
            Err(err) => self.fail_link(peer, err).await,
        }
    }

    async fn fail_link(&mut self, peer: &ParticipantId, err: Error) {
        warn!(peer_id = %peer, error = %err, "Negotiation failed, closing link");
        self.warn_notice(Some(peer), err.to_string());
        self.teardown_link(peer, "negotiation failed").await;
    }

    /// Remove the link from the table and release it; false if there was none
    async fn teardown_link(&mut self, peer: &ParticipantId, reason: &str) -> bool {
        let Some(mut link) = self.links.remove(peer) else {
            return false;
        };
        let released = link.close().await;
        self.orphan_candidates.remove(peer);
        self.closed_peers.insert(peer.clone());
        info!(
            peer_id = %peer,
            generation = link.generation(),
            reason,
            "Peer link torn down"
        );
        self.notify(SessionNotice::LinkStateChanged {
            peer: peer.clone(),
            state: LinkState::Closed,
        });
        released
    }

    async fn send_to(&mut self, peer: &ParticipantId, signal: Signal) {
        let kind = signal.kind();
        if let Err(err) = self.router.send_signal(Some(peer), &signal).await {
            warn!(peer_id = %peer, kind = %kind, error = %err, "Failed to send signal");
            self.warn_notice(Some(peer), format!("failed to send {kind}: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ConnectionState;
    use crate::protocol::SdpKind;
    use crate::sync::LoopClock;
    use crate::test_helpers::{audio_track, video_track, Call, FakeFactory, RecordingChannel};
    use crate::types::TrackId;
    use serde_json::{json, Value};

    struct Harness {
        session: Session,
        channel: Arc<RecordingChannel>,
        factory: Arc<FakeFactory>,
        clock: Arc<LoopClock>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    impl Harness {
        fn new(local: &str) -> Self {
            Self::with_media(local, LocalMedia::default())
        }

        fn with_media(local: &str, local_media: LocalMedia) -> Self {
            let channel = Arc::new(RecordingChannel::new(local));
            let factory = Arc::new(FakeFactory::new());
            let clock = Arc::new(LoopClock::new(8.0));
            let (session, link_rx) = Session::new(SessionParams {
                username: local.to_string(),
                config: SessionConfig::default(),
                channel: channel.clone(),
                connections: factory.clone(),
                clock: clock.clone(),
                local_media,
            });
            Self {
                session,
                channel,
                factory,
                clock,
                link_rx,
            }
        }

        async fn host_with_track(local: &str, track: &str) -> Self {
            let mut harness = Self::new(local);
            harness.session.set_master_track(audio_track(track)).await.unwrap();
            harness
        }

        async fn deliver(&mut self, from: &str, signal: Signal) {
            let envelope = SignalEnvelope::new(
                ParticipantId::from(from),
                Some(self.session.local_id().clone()),
                signal.kind(),
                signal.to_payload().unwrap(),
            );
            self.session.handle_channel_event(ChannelEvent::Signal(envelope)).await;
        }

        async fn pump_link_events(&mut self) {
            while let Ok(event) = self.link_rx.try_recv() {
                self.session.handle_link_event(event).await;
            }
        }

        fn sent(&self, kind: SignalKind, to: &str) -> Vec<SignalEnvelope> {
            self.channel
                .published()
                .into_iter()
                .filter(|e| e.kind == kind && e.to.as_ref().map(ParticipantId::as_str) == Some(to))
                .collect()
        }

        /// Answer the last offer sent to `viewer`
        async fn answer_from(&mut self, viewer: &str) {
            self.deliver(viewer, Signal::Answer(SessionDescription::answer(format!("v=0 answer {viewer}"))))
                .await;
        }
    }

    fn presence(id: &str, role: &str, streaming: bool) -> Value {
        json!({ "user_id": id, "username": id, "role": role, "streaming": streaming })
    }

    #[tokio::test]
    async fn test_start_as_host_requires_audio_source() {
        let mut harness = Harness::new("host");
        let err = harness.session.start_as_host().await.unwrap_err();
        assert!(matches!(err, Error::NoAudioSource));
        assert_eq!(harness.session.state(), SessionState::Idle);
        assert!(harness.channel.presence().is_none());
        assert!(harness.channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        assert!(matches!(
            harness.session.start_as_viewer().await,
            Err(Error::AlreadyActive(SessionState::Hosting))
        ));
    }

    #[tokio::test]
    async fn test_scenario_a_host_offers_to_present_viewer() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("viewer-1", "viewer", false)]))
            .await;
        assert_eq!(harness.session.link_count(), 0);

        harness.session.start_as_host().await.unwrap();

        let tracked = harness.channel.presence().unwrap();
        assert_eq!(tracked.role, Role::Host);
        assert!(tracked.streaming);

        let published = harness.channel.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, SignalKind::Offer);
        assert_eq!(published[0].from.as_str(), "host");
        assert_eq!(published[0].to.as_ref().unwrap().as_str(), "viewer-1");

        let link = harness.session.link(&ParticipantId::from("viewer-1")).unwrap();
        assert_eq!(link.state(), LinkState::OfferSent);
        assert_eq!(link.role(), LinkRole::Initiator);
        assert!(link.carries_master());

        // A later sync listing the same viewer does not produce a second offer
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("viewer-1", "viewer", false)]))
            .await;
        assert_eq!(harness.sent(SignalKind::Offer, "viewer-1").len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_late_viewer_gets_offer_and_sync() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.clock.seek(2.5);
        harness.clock.play();
        harness.session.start_as_host().await.unwrap();
        assert!(harness.channel.published().is_empty());

        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![presence("late", "viewer", false)]))
            .await;
        assert_eq!(harness.sent(SignalKind::Offer, "late").len(), 1);

        let request = SignalEnvelope::new(
            ParticipantId::from("late"),
            None,
            SignalKind::SyncRequest,
            Signal::SyncRequest.to_payload().unwrap(),
        );
        harness
            .session
            .handle_channel_event(ChannelEvent::Signal(request.clone()))
            .await;
        // Redelivery of the same envelope is not answered twice
        harness.session.handle_channel_event(ChannelEvent::Signal(request)).await;

        let responses = harness.sent(SignalKind::SyncResponse, "late");
        assert_eq!(responses.len(), 1);
        let Signal::SyncResponse(snapshot) = responses[0].decode().unwrap() else {
            panic!("expected a sync response");
        };
        assert!(snapshot.is_playing);
        assert!(snapshot.current_time >= 2.5);
        assert_eq!(snapshot.loop_duration, 8.0);
    }

    #[tokio::test]
    async fn test_scenario_c_master_replace_keeps_one_sender() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![
                presence("v1", "viewer", false),
                presence("v2", "viewer", false),
                presence("v3", "viewer", false),
            ]))
            .await;
        harness.session.start_as_host().await.unwrap();

        for viewer in ["v1", "v2", "v3"] {
            harness.answer_from(viewer).await;
            harness
                .factory
                .connection(viewer)
                .unwrap()
                .emit_state(ConnectionState::Connected);
        }
        harness.pump_link_events().await;
        for viewer in ["v1", "v2", "v3"] {
            let link = harness.session.link(&ParticipantId::from(viewer)).unwrap();
            assert_eq!(link.state(), LinkState::Connected);
        }

        harness.session.set_master_track(audio_track("B")).await.unwrap();

        for viewer in ["v1", "v2", "v3"] {
            let connection = harness.factory.connection(viewer).unwrap();
            assert_eq!(connection.audio_tracks(), vec![TrackId::from("B")]);
            assert_eq!(connection.max_audio_senders(), 1);
            assert_eq!(connection.count(|c| matches!(c, Call::RemoveTrack(_))), 0);
            // In-place replace needs no renegotiation
            assert_eq!(harness.sent(SignalKind::Offer, viewer).len(), 1);
            let link = harness.session.link(&ParticipantId::from(viewer)).unwrap();
            assert_eq!(link.state(), LinkState::Connected);
        }
        assert_eq!(harness.session.master().audio().unwrap().id().as_str(), "B");
    }

    #[tokio::test]
    async fn test_adding_video_renegotiates_once_per_link() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("v1", "viewer", false)]))
            .await;
        harness.session.start_as_host().await.unwrap();
        harness.answer_from("v1").await;
        harness.factory.connection("v1").unwrap().emit_state(ConnectionState::Connected);
        harness.pump_link_events().await;

        harness.session.set_master_track(video_track("cam")).await.unwrap();
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 2);

        // Same track again is a no-op
        harness.session.set_master_track(video_track("cam")).await.unwrap();
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 2);
        assert_eq!(
            harness.session.link(&ParticipantId::from("v1")).unwrap().state(),
            LinkState::OfferSent
        );
    }

    #[tokio::test]
    async fn test_scenario_d_leave_for_new_link() {
        let mut harness = Harness::new("viewer");
        harness.session.start_as_viewer().await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![presence("host", "host", true)]))
            .await;

        let link = harness.session.link(&ParticipantId::from("host")).unwrap();
        assert_eq!(link.state(), LinkState::New);
        assert_eq!(link.role(), LinkRole::Responder);

        let leave = ChannelEvent::PresenceLeave(vec![json!({ "user_id": "host" })]);
        harness.session.handle_channel_event(leave.clone()).await;
        assert_eq!(harness.session.link_count(), 0);

        // Second leave is harmless and releases nothing again
        harness.session.handle_channel_event(leave).await;
        let connection = harness.factory.connection("host").unwrap();
        assert_eq!(connection.count(|c| *c == Call::Close), 1);
    }

    #[tokio::test]
    async fn test_viewer_answers_offer_and_requests_sync() {
        let mut harness = Harness::new("viewer");
        harness.session.start_as_viewer().await.unwrap();

        let requests: Vec<_> = harness
            .channel
            .published()
            .into_iter()
            .filter(|e| e.kind == SignalKind::SyncRequest)
            .collect();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].to.is_none());
        assert_eq!(harness.session.link_count(), 0);

        // Offer from an unknown host creates a responder link on the fly
        harness.deliver("host", Signal::Offer(SessionDescription::offer("v=0 host"))).await;
        let answers = harness.sent(SignalKind::Answer, "host");
        assert_eq!(answers.len(), 1);
        let link = harness.session.link(&ParticipantId::from("host")).unwrap();
        assert_eq!(link.state(), LinkState::Answered);

        harness
            .deliver(
                "host",
                Signal::SyncResponse(SyncSnapshot {
                    current_time: 3.0,
                    loop_duration: 8.0,
                    is_playing: true,
                }),
            )
            .await;
        assert!(harness.clock.is_playing());
        assert!(harness.clock.position() >= 3.0);

        // Only the first response is applied
        harness.clock.pause();
        harness
            .deliver(
                "host",
                Signal::SyncResponse(SyncSnapshot {
                    current_time: 7.0,
                    loop_duration: 8.0,
                    is_playing: true,
                }),
            )
            .await;
        assert!(!harness.clock.is_playing());
    }

    #[tokio::test]
    async fn test_sync_request_without_streaming_host_is_not_answered() {
        let mut harness = Harness::new("viewer-a");
        harness.session.start_as_viewer().await.unwrap();
        harness.channel.take_published();

        let request = SignalEnvelope::new(
            ParticipantId::from("viewer-b"),
            None,
            SignalKind::SyncRequest,
            Signal::SyncRequest.to_payload().unwrap(),
        );
        harness.session.handle_channel_event(ChannelEvent::Signal(request)).await;
        assert!(harness.channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_applied_in_order() {
        let mut harness = Harness::new("viewer");
        harness.session.start_as_viewer().await.unwrap();

        for n in 1..=3 {
            harness
                .deliver("host", Signal::IceCandidate(IceCandidate::new(format!("candidate:{n}"))))
                .await;
        }
        assert_eq!(harness.session.link_count(), 0);

        harness.deliver("host", Signal::Offer(SessionDescription::offer("v=0 host"))).await;
        let connection = harness.factory.connection("host").unwrap();
        assert_eq!(
            connection.applied_candidates(),
            vec!["candidate:1", "candidate:2", "candidate:3"]
        );
        let calls = connection.calls();
        assert_eq!(calls[0], Call::SetRemote(SdpKind::Offer));
        assert_eq!(calls[1], Call::AddCandidate("candidate:1".to_string()));
    }

    #[tokio::test]
    async fn test_negotiation_failure_closes_only_that_link() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![
                presence("good", "viewer", false),
                presence("bad", "viewer", false),
            ]))
            .await;
        let mut notices = harness.session.subscribe_notices();
        harness.session.start_as_host().await.unwrap();

        harness.factory.connection("bad").unwrap().fail_set_remote();
        harness.answer_from("bad").await;
        harness.answer_from("good").await;

        assert!(harness.session.link(&ParticipantId::from("bad")).is_none());
        assert_eq!(
            harness.session.link(&ParticipantId::from("good")).unwrap().state(),
            LinkState::Answered
        );

        let mut warned = false;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::Warning { peer: Some(peer), .. } = notice {
                warned |= peer.as_str() == "bad";
            }
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn test_repeated_join_resets_missing_link() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        let join = ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]);
        harness.session.handle_channel_event(join.clone()).await;

        harness.factory.connection("v1").unwrap().emit_state(ConnectionState::Failed);
        harness.pump_link_events().await;
        assert!(harness.session.link(&ParticipantId::from("v1")).is_none());

        harness.session.handle_channel_event(join).await;
        assert_eq!(harness.factory.connections_for("v1"), 2);
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 2);
        assert_eq!(harness.session.link(&ParticipantId::from("v1")).unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_ignored() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        let join = ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]);
        harness.session.handle_channel_event(join.clone()).await;
        let first = harness.factory.connection("v1").unwrap();

        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceLeave(vec![json!({ "user_id": "v1" })]))
            .await;
        harness.session.handle_channel_event(join).await;

        // The torn-down connection reports failure late
        first.emit_state(ConnectionState::Failed);
        harness.pump_link_events().await;
        assert_eq!(
            harness.session.link(&ParticipantId::from("v1")).unwrap().state(),
            LinkState::OfferSent
        );
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]))
            .await;

        harness
            .factory
            .connection("v1")
            .unwrap()
            .emit_candidate(IceCandidate::new("candidate:local"));
        harness.pump_link_events().await;

        let sent = harness.sent(SignalKind::IceCandidate, "v1");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].decode().unwrap(),
            Signal::IceCandidate(IceCandidate::new("candidate:local"))
        );
    }

    #[tokio::test]
    async fn test_viewer_drops_link_when_host_stops_streaming() {
        let mut harness = Harness::new("viewer");
        harness.session.start_as_viewer().await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("host", "host", true)]))
            .await;
        assert_eq!(harness.session.link_count(), 1);

        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("host", "host", false)]))
            .await;
        assert_eq!(harness.session.link_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_everything_and_withdraws_presence() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![
                presence("v1", "viewer", false),
                presence("v2", "viewer", false),
            ]))
            .await;
        harness.session.start_as_host().await.unwrap();
        assert_eq!(harness.session.link_count(), 2);

        harness.session.stop().await.unwrap();
        assert_eq!(harness.session.state(), SessionState::Idle);
        assert_eq!(harness.session.link_count(), 0);
        assert!(!harness.session.master().is_ready());
        assert!(harness.channel.presence().is_none());
        for viewer in ["v1", "v2"] {
            let connection = harness.factory.connection(viewer).unwrap();
            assert_eq!(connection.count(|c| *c == Call::Close), 1);
        }

        // Stopping again is a no-op
        harness.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_toggles_affect_local_tracks_only() {
        let microphone = audio_track("mic");
        let mut harness = Harness::with_media(
            "host",
            LocalMedia {
                microphone: Some(microphone.clone()),
                camera: None,
            },
        );
        harness.session.set_master_track(audio_track("A")).await.unwrap();

        assert!(!harness.session.toggle_audio().await.unwrap());
        assert!(!microphone.is_enabled());
        assert!(harness.session.master().audio().unwrap().is_enabled());
        assert!(matches!(
            harness.session.toggle_video().await,
            Err(Error::NoLocalTrack(TrackKind::Video))
        ));
    }

    #[tokio::test]
    async fn test_host_camera_is_attached_and_toggle_pauses_it() {
        let camera = video_track("cam");
        let mut harness = Harness::with_media(
            "host",
            LocalMedia {
                microphone: Some(audio_track("mic")),
                camera: Some(camera.clone()),
            },
        );
        harness.session.set_master_track(audio_track("A")).await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("v1", "viewer", false)]))
            .await;
        harness.session.start_as_host().await.unwrap();
        harness.answer_from("v1").await;

        let connection = harness.factory.connection("v1").unwrap();
        // The master keeps the audio slot; the microphone is not sent alongside it
        assert_eq!(connection.audio_tracks(), vec![TrackId::from("A")]);
        assert_eq!(connection.max_audio_senders(), 1);
        assert_eq!(connection.video_tracks(), vec![TrackId::from("cam")]);
        assert_eq!(harness.session.link(&ParticipantId::from("v1")).unwrap().sender_count(), 2);

        assert!(!harness.session.toggle_video().await.unwrap());
        assert!(connection.video_tracks().is_empty());
        assert_eq!(connection.sender_count(TrackKind::Video), 1);
        assert_eq!(connection.count(|c| matches!(c, Call::PauseSender(_))), 1);

        assert!(harness.session.toggle_video().await.unwrap());
        assert_eq!(connection.video_tracks(), vec![TrackId::from("cam")]);

        // Muting the microphone touches no link, the master is unaffected
        let calls = connection.calls().len();
        assert!(!harness.session.toggle_audio().await.unwrap());
        assert_eq!(connection.calls().len(), calls);
        assert_eq!(connection.audio_tracks(), vec![TrackId::from("A")]);

        // Pausing and resuming needs no renegotiation
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 1);
    }

    #[tokio::test]
    async fn test_viewer_sends_local_media_in_its_answer() {
        let mut harness = Harness::with_media(
            "viewer",
            LocalMedia {
                microphone: Some(audio_track("mic")),
                camera: None,
            },
        );
        harness.session.start_as_viewer().await.unwrap();
        harness.deliver("host", Signal::Offer(SessionDescription::offer("v=0 host"))).await;

        let connection = harness.factory.connection("host").unwrap();
        let calls = connection.calls();
        let added = calls.iter().position(|c| *c == Call::AddTrack(TrackId::from("mic"))).unwrap();
        let answered = calls.iter().position(|c| *c == Call::CreateAnswer).unwrap();
        assert!(added < answered);

        assert!(!harness.session.toggle_audio().await.unwrap());
        assert!(connection.audio_tracks().is_empty());
        assert_eq!(connection.sender_count(TrackKind::Audio), 1);
    }

    #[tokio::test]
    async fn test_candidates_from_torn_down_link_do_not_reach_the_next_one() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        let join = ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]);
        harness.session.handle_channel_event(join.clone()).await;

        harness.factory.connection("v1").unwrap().emit_state(ConnectionState::Failed);
        harness.pump_link_events().await;
        harness
            .deliver("v1", Signal::IceCandidate(IceCandidate::new("candidate:stale-gen1")))
            .await;

        harness.session.handle_channel_event(join).await;
        harness.answer_from("v1").await;
        harness
            .deliver("v1", Signal::IceCandidate(IceCandidate::new("candidate:fresh-gen2")))
            .await;

        let connection = harness.factory.connection("v1").unwrap();
        assert_eq!(harness.session.link(&ParticipantId::from("v1")).unwrap().generation(), 2);
        assert_eq!(connection.applied_candidates(), vec!["candidate:fresh-gen2"]);
    }

    #[tokio::test]
    async fn test_host_ignores_offers_and_initiates_itself() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();

        harness.deliver("v1", Signal::Offer(SessionDescription::offer("v=0 viewer"))).await;
        assert_eq!(harness.session.link_count(), 0);
        assert!(harness.sent(SignalKind::Answer, "v1").is_empty());

        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]))
            .await;
        let link = harness.session.link(&ParticipantId::from("v1")).unwrap();
        assert_eq!(link.role(), LinkRole::Initiator);
        assert!(link.carries_master());
        assert_eq!(link.sender_count(), 1);
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 1);
    }

    #[tokio::test]
    async fn test_clearing_master_video_removes_sender_and_renegotiates() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.set_master_track(video_track("V")).await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("v1", "viewer", false)]))
            .await;
        harness.session.start_as_host().await.unwrap();
        harness.answer_from("v1").await;
        harness.factory.connection("v1").unwrap().emit_state(ConnectionState::Connected);
        harness.pump_link_events().await;

        harness.session.clear_master_video().await.unwrap();

        let connection = harness.factory.connection("v1").unwrap();
        assert_eq!(connection.count(|c| matches!(c, Call::RemoveTrack(_))), 1);
        assert!(connection.video_tracks().is_empty());
        assert_eq!(connection.audio_tracks(), vec![TrackId::from("A")]);
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 2);
        assert!(harness.session.master().video().is_none());

        // Nothing left to clear
        harness.session.clear_master_video().await.unwrap();
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 2);
    }

    #[tokio::test]
    async fn test_clearing_master_video_falls_back_to_camera_in_place() {
        let mut harness = Harness::with_media(
            "host",
            LocalMedia {
                microphone: None,
                camera: Some(video_track("cam")),
            },
        );
        harness.session.set_master_track(audio_track("A")).await.unwrap();
        harness.session.set_master_track(video_track("V")).await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceSync(vec![presence("v1", "viewer", false)]))
            .await;
        harness.session.start_as_host().await.unwrap();
        harness.answer_from("v1").await;

        let connection = harness.factory.connection("v1").unwrap();
        assert_eq!(connection.video_tracks(), vec![TrackId::from("V")]);

        harness.session.clear_master_video().await.unwrap();
        assert_eq!(connection.video_tracks(), vec![TrackId::from("cam")]);
        assert_eq!(connection.count(|c| matches!(c, Call::RemoveTrack(_))), 0);
        assert_eq!(harness.sent(SignalKind::Offer, "v1").len(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_links() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![
                presence("b", "viewer", false),
                presence("a", "viewer", false),
            ]))
            .await;

        let status = harness.session.status();
        assert_eq!(status.state, SessionState::Hosting);
        assert_eq!(status.roster_size, 2);
        assert!(status.master_ready);
        let peers: Vec<_> = status.links.iter().map(|l| l.peer.as_str()).collect();
        assert_eq!(peers, vec!["a", "b"]);
        assert!(status.links.iter().all(|l| l.senders == 1 && l.state == LinkState::OfferSent));
    }

    #[tokio::test]
    async fn test_link_limit() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.config.max_links = 1;
        harness.session.start_as_host().await.unwrap();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![
                presence("a", "viewer", false),
                presence("b", "viewer", false),
            ]))
            .await;
        assert_eq!(harness.session.link_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut harness = Harness::host_with_track("host", "A").await;
        harness.session.start_as_host().await.unwrap();
        let mut notices = harness.session.subscribe_notices();
        harness.factory.fail_next_connect();
        harness
            .session
            .handle_channel_event(ChannelEvent::PresenceJoin(vec![presence("v1", "viewer", false)]))
            .await;
        assert_eq!(harness.session.link_count(), 0);
        assert!(matches!(notices.try_recv(), Ok(SessionNotice::Warning { .. })));
    }
}
