//! In-process session hub
//!
//! Implements the channel collaborator for single-node use: per-session
//! presence state and fan-out of envelopes to every subscriber. Each
//! subscriber gets an unbounded receiver of [`ChannelEvent`]s.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, SessionChannel};
use crate::error::{Error, Result};
use crate::protocol::{PresencePayload, SignalEnvelope};
use crate::types::{ParticipantId, SessionId};

/// Message sender for a subscriber
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

#[derive(Debug, Clone)]
struct Subscriber {
    participant_id: ParticipantId,
    sender: EventSender,
}

#[derive(Default)]
struct HubSession {
    subscribers: Vec<Subscriber>,
    presence: HashMap<ParticipantId, Value>,
}

impl HubSession {
    fn presence_state(&self) -> Vec<Value> {
        self.presence.values().cloned().collect()
    }
}

/// In-memory hub routing presence and envelopes between participants
#[derive(Clone, Default)]
pub struct SessionHub {
    sessions: Arc<DashMap<SessionId, HubSession>>,
}

impl SessionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a participant to a session
    ///
    /// The returned receiver starts with a presence sync of the current state.
    /// A participant that connects twice replaces its previous subscription.
    pub fn connect(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> (HubChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut session = self.sessions.entry(session_id.clone()).or_default();
            session
                .subscribers
                .retain(|sub| sub.participant_id != participant_id);
            let _ = tx.send(ChannelEvent::PresenceSync(session.presence_state()));
            session.subscribers.push(Subscriber {
                participant_id: participant_id.clone(),
                sender: tx,
            });
        }

        info!(
            session_id = %session_id,
            participant_id = %participant_id,
            "Participant subscribed to session"
        );

        let channel = HubChannel {
            hub: self.clone(),
            session_id,
            participant_id,
        };
        (channel, rx)
    }

    fn track(&self, session_id: &SessionId, payload: &PresencePayload) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Channel(format!("session {session_id} has no subscribers")))?;

        session.presence.insert(payload.user_id.clone(), value.clone());
        let state = session.presence_state();
        let failed = Self::fan_out(&session.subscribers, None, || ChannelEvent::PresenceJoin(vec![value.clone()]));
        let failed_sync = Self::fan_out(&session.subscribers, None, || ChannelEvent::PresenceSync(state.clone()));
        Self::prune(&mut session, &failed);
        Self::prune(&mut session, &failed_sync);

        debug!(
            session_id = %session_id,
            participant_id = %payload.user_id,
            role = %payload.role,
            streaming = payload.streaming,
            "Presence tracked"
        );
        Ok(())
    }

    fn untrack(&self, session_id: &SessionId, participant_id: &ParticipantId) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(value) = session.presence.remove(participant_id) else {
            return;
        };

        let state = session.presence_state();
        let failed = Self::fan_out(&session.subscribers, None, || ChannelEvent::PresenceLeave(vec![value.clone()]));
        let failed_sync = Self::fan_out(&session.subscribers, None, || ChannelEvent::PresenceSync(state.clone()));
        Self::prune(&mut session, &failed);
        Self::prune(&mut session, &failed_sync);

        debug!(
            session_id = %session_id,
            participant_id = %participant_id,
            "Presence withdrawn"
        );
    }

    fn publish(&self, session_id: &SessionId, envelope: &SignalEnvelope) -> usize {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        let failed = Self::fan_out(&session.subscribers, Some(&envelope.from), || {
            ChannelEvent::Signal(envelope.clone())
        });
        let sent = session.subscribers.len().saturating_sub(1 + failed.len());
        Self::prune(&mut session, &failed);
        sent
    }

    /// Unsubscribe a participant, withdrawing its presence
    pub fn disconnect(&self, session_id: &SessionId, participant_id: &ParticipantId) {
        self.untrack(session_id, participant_id);

        let mut remove_session = false;
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session
                .subscribers
                .retain(|sub| sub.participant_id != *participant_id);
            remove_session = session.subscribers.is_empty() && session.presence.is_empty();
        }
        if remove_session {
            self.sessions.remove(session_id);
            debug!(session_id = %session_id, "Session has no more subscribers, removed");
        }

        info!(
            session_id = %session_id,
            participant_id = %participant_id,
            "Participant unsubscribed from session"
        );
    }

    /// Send to every subscriber except `skip`; returns the ids whose receiver is gone
    fn fan_out<F>(subscribers: &[Subscriber], skip: Option<&ParticipantId>, event: F) -> Vec<ParticipantId>
    where
        F: Fn() -> ChannelEvent,
    {
        let mut failed = Vec::new();
        for subscriber in subscribers {
            if Some(&subscriber.participant_id) == skip {
                continue;
            }
            if subscriber.sender.send(event()).is_err() {
                warn!(
                    participant_id = %subscriber.participant_id,
                    "Failed to deliver channel event, dropping subscriber"
                );
                failed.push(subscriber.participant_id.clone());
            }
        }
        failed
    }

    fn prune(session: &mut HubSession, failed: &[ParticipantId]) {
        if failed.is_empty() {
            return;
        }
        session
            .subscribers
            .retain(|sub| !failed.contains(&sub.participant_id));
    }

    /// Number of subscribers in a session
    #[must_use]
    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .get(session_id)
            .map(|session| session.subscribers.len())
            .unwrap_or(0)
    }

    /// Participants currently announcing presence in a session
    #[must_use]
    pub fn present(&self, session_id: &SessionId) -> Vec<ParticipantId> {
        self.sessions
            .get(session_id)
            .map(|session| session.presence.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// One participant's subscription to a hub session
pub struct HubChannel {
    hub: SessionHub,
    session_id: SessionId,
    participant_id: ParticipantId,
}

#[async_trait]
impl SessionChannel for HubChannel {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn local_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    async fn track(&self, presence: &PresencePayload) -> Result<()> {
        if presence.user_id != self.participant_id {
            return Err(Error::Channel(format!(
                "{} cannot announce presence for {}",
                self.participant_id, presence.user_id
            )));
        }
        self.hub.track(&self.session_id, presence)
    }

    async fn untrack(&self) -> Result<()> {
        self.hub.untrack(&self.session_id, &self.participant_id);
        Ok(())
    }

    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()> {
        let sent = self.hub.publish(&self.session_id, envelope);
        debug!(
            session_id = %self.session_id,
            kind = %envelope.kind,
            sent_count = sent,
            "Envelope fanned out"
        );
        Ok(())
    }
}

impl Drop for HubChannel {
    fn drop(&mut self) {
        self.hub.disconnect(&self.session_id, &self.participant_id);
    }
}
