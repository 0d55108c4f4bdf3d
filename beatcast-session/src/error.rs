//! Error types for the session core

use crate::session::SessionState;
use crate::types::TrackKind;
use thiserror::Error;

/// Session error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("No master audio source is available")]
    NoAudioSource,

    #[error("Session is already {0}")]
    AlreadyActive(SessionState),

    #[error("No local {0} track")]
    NoLocalTrack(TrackKind),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Link limit reached ({0} links)")]
    LinkLimit(usize),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Session driver has shut down")]
    Closed,
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;
