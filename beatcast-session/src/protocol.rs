//! Wire format of everything exchanged over the session channel
//!
//! Envelopes are JSON objects fanned out to every subscriber of the channel:
//!
//! ```json
//! { "id": "V1StGXR8_Z5jdHi6B-myT", "from": "host-1", "to": "viewer-7",
//!   "kind": "offer", "payload": { "type": "offer", "sdp": "v=0..." },
//!   "timestamp": "2026-01-01T00:00:00Z" }
//! ```
//!
//! `to` is `null` for messages addressed to "any host" (only `sync-request`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{ParticipantId, Role};

/// Kind of a signal envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    SyncRequest,
    SyncResponse,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::SyncRequest => "sync-request",
            Self::SyncResponse => "sync-response",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-to-point message carried over the shared broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Unique per envelope; redeliveries keep the same id
    pub id: String,
    pub from: ParticipantId,
    /// `None` addresses any host
    pub to: Option<ParticipantId>,
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalEnvelope {
    #[must_use]
    pub fn new(
        from: ParticipantId,
        to: Option<ParticipantId>,
        kind: SignalKind,
        payload: Value,
    ) -> Self {
        Self {
            id: nanoid::nanoid!(),
            from,
            to,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Parse the payload according to `kind`
    pub fn decode(&self) -> Result<Signal> {
        let payload = self.payload.clone();
        let signal = match self.kind {
            SignalKind::Offer => {
                let desc: SessionDescription = serde_json::from_value(payload)?;
                if desc.kind != SdpKind::Offer {
                    return Err(Error::InvalidPayload(format!(
                        "offer envelope carries a {:?} description",
                        desc.kind
                    )));
                }
                Signal::Offer(desc)
            }
            SignalKind::Answer => {
                let desc: SessionDescription = serde_json::from_value(payload)?;
                if desc.kind != SdpKind::Answer {
                    return Err(Error::InvalidPayload(format!(
                        "answer envelope carries a {:?} description",
                        desc.kind
                    )));
                }
                Signal::Answer(desc)
            }
            SignalKind::IceCandidate => Signal::IceCandidate(serde_json::from_value(payload)?),
            SignalKind::SyncRequest => Signal::SyncRequest,
            SignalKind::SyncResponse => Signal::SyncResponse(serde_json::from_value(payload)?),
        };
        Ok(signal)
    }
}

/// Typed view of an envelope payload
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    SyncRequest,
    SyncResponse(SyncSnapshot),
}

impl Signal {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::SyncRequest => SignalKind::SyncRequest,
            Self::SyncResponse(_) => SignalKind::SyncResponse,
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        let value = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_value(desc)?,
            Self::IceCandidate(candidate) => serde_json::to_value(candidate)?,
            Self::SyncRequest => Value::Object(serde_json::Map::new()),
            Self::SyncResponse(snapshot) => serde_json::to_value(snapshot)?,
        };
        Ok(value)
    }
}

/// A signal that passed the router's filters
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub from: ParticipantId,
    pub signal: Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session-description blob, same JSON shape as a browser `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate blob, same JSON shape as a browser `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Host playback position reported to a late joiner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Position inside the loop, in seconds
    pub current_time: f64,
    /// Loop length in seconds (0 when nothing is loaded)
    pub loop_duration: f64,
    pub is_playing: bool,
}

/// Per-participant presence payload announced on the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: ParticipantId,
    pub username: String,
    pub role: Role,
    pub streaming: bool,
}
