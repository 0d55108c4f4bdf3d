use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Media stack crates that log every packet and ICE check below `warn`
const MEDIA_STACK_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "turn",
];

/// Install the global subscriber for a beatcast process
///
/// `RUST_LOG` wins over the configured level when set. Otherwise the media
/// stack is capped at `warn` so session events stay readable. Formats are
/// `json` for machines, `compact` for one line per event and `pretty`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let to_file = config.file_path.is_some();
    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init()?,
        "compact" => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_ansi(!to_file)
                    .with_writer(writer),
            )
            .try_init()?,
        _ => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(false)
                    .with_ansi(!to_file)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(&config.level)?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::new(level.to_string());
    if level > Level::WARN {
        for target in MEDIA_STACK_TARGETS {
            filter = filter.add_directive(format!("{target}=warn").parse()?);
        }
    }
    Ok(filter)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
