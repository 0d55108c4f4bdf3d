//! Signal routing
//!
//! Point-to-point negotiation messages travel over the shared channel. The
//! router stamps outgoing envelopes and, for incoming ones, keeps only those
//! addressed to the local participant (or to "any host"), drops echoes of
//! our own envelopes and redeliveries, and decodes the payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::SessionChannel;
use crate::dedup::{DedupKey, MessageDeduplicator};
use crate::error::Result;
use crate::protocol::{InboundSignal, Signal, SignalEnvelope, SignalKind};
use crate::types::ParticipantId;

/// Observer invoked for every accepted envelope of one kind
pub type SignalHandler = Box<dyn Fn(&SignalEnvelope) + Send + Sync>;

pub struct SignalRouter {
    local_id: ParticipantId,
    channel: Arc<dyn SessionChannel>,
    dedup: MessageDeduplicator,
    handlers: HashMap<SignalKind, Vec<SignalHandler>>,
}

impl SignalRouter {
    #[must_use]
    pub fn new(channel: Arc<dyn SessionChannel>, dedup_window: Duration) -> Self {
        Self {
            local_id: channel.local_id().clone(),
            channel,
            dedup: MessageDeduplicator::new(dedup_window),
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SessionChannel> {
        &self.channel
    }

    /// Publish an envelope; fire-and-forget, no delivery acknowledgment
    pub async fn send(
        &self,
        kind: SignalKind,
        to: Option<&ParticipantId>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let envelope = SignalEnvelope::new(self.local_id.clone(), to.cloned(), kind, payload);
        debug!(
            kind = %kind,
            to = ?envelope.to.as_ref().map(ParticipantId::as_str),
            envelope_id = %envelope.id,
            "Sending signal"
        );
        self.channel.publish(&envelope).await
    }

    /// Encode and publish a typed signal
    pub async fn send_signal(&self, to: Option<&ParticipantId>, signal: &Signal) -> Result<()> {
        self.send(signal.kind(), to, signal.to_payload()?).await
    }

    /// Register an observer for accepted envelopes of `kind`
    pub fn on_receive<F>(&mut self, kind: SignalKind, handler: F)
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Filter, de-duplicate and decode an envelope from the channel
    ///
    /// Returns `None` for envelopes that are not ours to handle. Registered
    /// observers run once per accepted envelope.
    pub fn accept(&mut self, envelope: &SignalEnvelope) -> Option<InboundSignal> {
        if envelope.from == self.local_id {
            debug!(envelope_id = %envelope.id, "Dropping echo of own envelope");
            return None;
        }
        match &envelope.to {
            Some(to) if *to != self.local_id => return None,
            None if envelope.kind != SignalKind::SyncRequest => {
                debug!(
                    kind = %envelope.kind,
                    from = %envelope.from,
                    "Dropping unaddressed envelope"
                );
                return None;
            }
            _ => {}
        }

        if !self.dedup.should_process(&DedupKey::from_envelope(envelope)) {
            debug!(
                envelope_id = %envelope.id,
                kind = %envelope.kind,
                from = %envelope.from,
                "Dropping duplicate envelope"
            );
            return None;
        }

        let signal = match envelope.decode() {
            Ok(signal) => signal,
            Err(err) => {
                warn!(
                    kind = %envelope.kind,
                    from = %envelope.from,
                    error = %err,
                    "Dropping envelope with malformed payload"
                );
                return None;
            }
        };

        if let Some(handlers) = self.handlers.get(&envelope.kind) {
            for handler in handlers {
                handler(envelope);
            }
        }

        Some(InboundSignal {
            from: envelope.from.clone(),
            signal,
        })
    }
}
