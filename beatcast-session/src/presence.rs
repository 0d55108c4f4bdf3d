//! Presence tracking
//!
//! Maintains the session roster from the channel's presence feed. Raw
//! payloads are validated against [`PresencePayload`] at this boundary;
//! malformed entries are logged and skipped. The local participant is never
//! part of the roster.
//!
//! Every call returns a [`RosterDelta`] describing what changed, so the
//! coordinator can create links for new participants and tear down links of
//! departed ones:
//!
//! - `sync` replaces the roster: ids that disappear are reported as left,
//!   new ids as joined, changed payloads as updated.
//! - `join` adds or updates; a join for a known id with an identical payload
//!   changes nothing and is reported as `repeated`.
//! - `leave` removes; leaving an absent id is a no-op.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::protocol::PresencePayload;
use crate::types::{ParticipantId, Role};

/// A participant as seen by the roster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub username: String,
    pub role: Role,
    pub streaming: bool,
}

impl Participant {
    #[must_use]
    pub fn is_streaming_host(&self) -> bool {
        self.role == Role::Host && self.streaming
    }
}

impl TryFrom<PresencePayload> for Participant {
    type Error = String;

    fn try_from(payload: PresencePayload) -> Result<Self, Self::Error> {
        if payload.user_id.is_empty() {
            return Err("empty user_id".to_string());
        }
        if payload.streaming && payload.role != Role::Host {
            return Err(format!("{} is streaming without the host role", payload.user_id));
        }
        Ok(Self {
            id: payload.user_id,
            username: payload.username,
            role: payload.role,
            streaming: payload.streaming,
        })
    }
}

/// Changes produced by one presence event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDelta {
    pub joined: Vec<Participant>,
    pub updated: Vec<Participant>,
    /// Known ids announced again by a `join` with an unchanged payload
    pub repeated: Vec<ParticipantId>,
    pub left: Vec<Participant>,
}

impl RosterDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
            && self.updated.is_empty()
            && self.repeated.is_empty()
            && self.left.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct LeaveKey {
    user_id: ParticipantId,
}

/// Roster of the remote participants in one session
pub struct PresenceTracker {
    local_id: ParticipantId,
    roster: HashMap<ParticipantId, Participant>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            roster: HashMap::new(),
        }
    }

    /// Replace the roster with a full presence state
    pub fn sync(&mut self, entries: &[Value]) -> RosterDelta {
        let mut next: HashMap<ParticipantId, Participant> = HashMap::new();
        for participant in entries.iter().filter_map(|entry| self.parse(entry)) {
            next.insert(participant.id.clone(), participant);
        }

        let mut delta = RosterDelta::default();

        for (id, previous) in &self.roster {
            if !next.contains_key(id) {
                delta.left.push(previous.clone());
            }
        }
        for (id, participant) in &next {
            match self.roster.get(id) {
                None => delta.joined.push(participant.clone()),
                Some(previous) if previous != participant => delta.updated.push(participant.clone()),
                Some(_) => {}
            }
        }

        self.roster = next;

        debug!(
            roster_size = self.roster.len(),
            joined = delta.joined.len(),
            updated = delta.updated.len(),
            left = delta.left.len(),
            "Presence sync applied"
        );

        delta
    }

    /// Add or update participants
    pub fn join(&mut self, entries: &[Value]) -> RosterDelta {
        let mut delta = RosterDelta::default();

        let parsed: Vec<Participant> = entries.iter().filter_map(|entry| self.parse(entry)).collect();
        for participant in parsed {
            match self.roster.get(&participant.id) {
                None => {
                    delta.joined.push(participant.clone());
                    self.roster.insert(participant.id.clone(), participant);
                }
                Some(previous) if *previous != participant => {
                    delta.updated.push(participant.clone());
                    self.roster.insert(participant.id.clone(), participant);
                }
                Some(_) => delta.repeated.push(participant.id),
            }
        }

        delta
    }

    /// Remove participants; only `user_id` is required in each entry
    pub fn leave(&mut self, entries: &[Value]) -> RosterDelta {
        let mut delta = RosterDelta::default();

        for entry in entries {
            let key = match LeaveKey::deserialize(entry) {
                Ok(key) => key,
                Err(err) => {
                    warn!(error = %err, "Ignoring malformed presence leave");
                    continue;
                }
            };
            if key.user_id == self.local_id {
                continue;
            }
            match self.roster.remove(&key.user_id) {
                Some(participant) => delta.left.push(participant),
                None => debug!(participant_id = %key.user_id, "Leave for absent participant ignored"),
            }
        }

        delta
    }

    fn parse(&self, entry: &Value) -> Option<Participant> {
        let payload = match PresencePayload::deserialize(entry) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Ignoring malformed presence payload");
                return None;
            }
        };
        if payload.user_id == self.local_id {
            return None;
        }
        match Participant::try_from(payload) {
            Ok(participant) => Some(participant),
            Err(reason) => {
                warn!(reason = %reason, "Ignoring invalid presence payload");
                None
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.roster.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.roster.contains_key(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values().filter(|p| p.role == Role::Viewer)
    }

    pub fn streaming_hosts(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values().filter(|p| p.is_streaming_host())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roster.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn clear(&mut self) {
        self.roster.clear();
    }
}
