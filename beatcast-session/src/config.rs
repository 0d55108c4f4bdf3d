use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub webrtc: WebRtcConfig,
    pub logging: LoggingConfig,
}

/// Coordinator tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a link may sit mid-negotiation before a repeated join resets it
    pub negotiation_timeout_secs: u64,
    /// How long an accepted envelope id is remembered
    pub dedup_window_secs: u64,
    /// Maximum concurrent peer links (0 = unlimited)
    pub max_links: usize,
    /// Maximum ICE candidates queued for a participant that has no link yet
    pub max_pending_candidates: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: 15,
            dedup_window_secs: 30,
            max_links: 0,
            max_pending_candidates: 64,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs (e.g. "stun:stun.l.google.com:19302")
    pub stun_servers: Vec<String>,
    /// TURN server URL (e.g. "turn:turn.example.com:3478")
    pub turn_server_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_server_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "compact" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // BEATCAST_SESSION__MAX_LINKS=10, BEATCAST_LOGGING__LEVEL=debug, ...
        builder = builder.add_source(
            Environment::with_prefix("BEATCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check for values that would make the session misbehave
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session.negotiation_timeout_secs == 0 {
            errors.push("session.negotiation_timeout_secs must be greater than 0".to_string());
        }
        if self.session.dedup_window_secs == 0 {
            errors.push("session.dedup_window_secs must be greater than 0".to_string());
        }
        for url in &self.webrtc.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                errors.push(format!("webrtc.stun_servers: '{url}' is not a stun: URL"));
            }
        }
        if let Some(url) = &self.webrtc.turn_server_url {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                errors.push(format!("webrtc.turn_server_url: '{url}' is not a turn: URL"));
            }
            if self.webrtc.turn_username.is_none() || self.webrtc.turn_credential.is_none() {
                errors.push("webrtc.turn_server_url requires turn_username and turn_credential".to_string());
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "compact" | "pretty") {
            errors.push(format!("logging.format: '{}' is not json, compact or pretty", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
