//! Structured logging.
//!
//! # Responsibilities
//! - Validate the configured logger name and level
//! - Install the global tracing subscriber
//! - Provide the root span carrying the logger name
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - Invalid names or levels are errors, never silently defaulted

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Errors raised while configuring logging.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoggingError {
    #[error("invalid logger name \"{0}\"")]
    InvalidName(String),

    #[error("invalid log level \"{0}\"")]
    InvalidLevel(String),

    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Parse a level name. Accepts `fatal` in addition to the tracing levels.
pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "fatal" | "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(LoggingError::InvalidLevel(level.to_string())),
    }
}

pub fn validate_name(name: &str) -> Result<&str, LoggingError> {
    if name.trim().is_empty() {
        return Err(LoggingError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Install the global subscriber and return the root span for the process.
pub fn init(config: &ObservabilityConfig) -> Result<tracing::Span, LoggingError> {
    let name = validate_name(&config.log_name)?;
    let level = parse_level(&config.log_level)?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(tracing::info_span!("service", name = %name))
}
