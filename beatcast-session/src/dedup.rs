//! Envelope deduplication
//!
//! The channel delivers at least once, so the same envelope can arrive more
//! than once. Accepted ids are remembered for a window; a repeat inside the
//! window is dropped.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::SignalEnvelope;
use crate::types::ParticipantId;

/// Deduplication key for envelopes
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DedupKey {
    pub from: ParticipantId,
    pub envelope_id: String,
}

impl DedupKey {
    #[must_use]
    pub fn from_envelope(envelope: &SignalEnvelope) -> Self {
        Self {
            from: envelope.from.clone(),
            envelope_id: envelope.id.clone(),
        }
    }
}

/// Remembers recently accepted envelopes
pub struct MessageDeduplicator {
    entries: HashMap<DedupKey, Instant>,
    /// Insertion order, used to expire entries without scanning the map
    order: VecDeque<(Instant, DedupKey)>,
    dedup_window: Duration,
}

impl MessageDeduplicator {
    #[must_use]
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            dedup_window,
        }
    }

    /// Returns true the first time a key is seen within the window
    pub fn should_process(&mut self, key: &DedupKey) -> bool {
        let now = Instant::now();
        self.cleanup_expired(now);

        if let Some(expires_at) = self.entries.get(key) {
            if *expires_at > now {
                return false;
            }
        }

        let expires_at = now + self.dedup_window;
        self.entries.insert(key.clone(), expires_at);
        self.order.push_back((expires_at, key.clone()));
        true
    }

    fn cleanup_expired(&mut self, now: Instant) {
        while let Some((expires_at, _)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            if let Some((expires_at, key)) = self.order.pop_front() {
                // A newer insert of the same key owns the map entry
                if self.entries.get(&key) == Some(&expires_at) {
                    self.entries.remove(&key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
