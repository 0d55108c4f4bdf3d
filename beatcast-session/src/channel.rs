//! Transport seam: a named broadcast channel with presence

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{PresencePayload, SignalEnvelope};
use crate::types::{ParticipantId, SessionId};

/// Inbound traffic of a channel subscription
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Full presence state; entries are raw per-participant payloads
    PresenceSync(Vec<Value>),
    /// Participants that announced (or re-announced) presence
    PresenceJoin(Vec<Value>),
    /// Participants whose presence was withdrawn
    PresenceLeave(Vec<Value>),
    /// Envelope published by any subscriber
    Signal(SignalEnvelope),
}

impl ChannelEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::PresenceSync(_) => "presence_sync",
            Self::PresenceJoin(_) => "presence_join",
            Self::PresenceLeave(_) => "presence_leave",
            Self::Signal(_) => "signal",
        }
    }
}

/// Outbound half of a channel subscription
///
/// Delivery is at least once with no ordering across publishers. Every
/// subscriber receives every envelope and filters by recipient itself.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    fn session_id(&self) -> &SessionId;

    fn local_id(&self) -> &ParticipantId;

    /// Announce or update this participant's presence payload
    async fn track(&self, presence: &PresencePayload) -> Result<()>;

    /// Withdraw this participant's presence
    async fn untrack(&self) -> Result<()>;

    /// Fan an envelope out to the other subscribers
    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()>;
}
