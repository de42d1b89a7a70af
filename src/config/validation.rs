//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (subscriptions reference configured connections)
//! - Validate value ranges and formats (deadline > 0, URIs, log level)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::AppConfig;
use crate::observability::logging;

/// URI schemes with a shipped driver.
const SUPPORTED_SCHEMES: &[&str] = &["redis", "memory"];

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("observability.log_name must not be empty")]
    EmptyLogName,

    #[error("observability.log_level '{0}' is not a known level")]
    InvalidLogLevel(String),

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("shutdown.deadline_ms must be greater than zero")]
    ZeroDeadline,

    #[error("keys.prefix must not be empty when set")]
    EmptyPrefix,

    #[error("connection label must not be empty")]
    EmptyLabel,

    #[error("connection label '{0}' is defined more than once")]
    DuplicateLabel(String),

    #[error("connection '{label}' has invalid uri '{uri}'")]
    InvalidUri { label: String, uri: String },

    #[error("connection '{label}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { label: String, scheme: String },

    #[error("subscription references unknown connection '{0}'")]
    UnknownSubscriptionLabel(String),

    #[error("subscription on '{0}' has an empty channel name")]
    EmptyChannel(String),
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let observability = &config.observability;
    if logging::validate_name(&observability.log_name).is_err() {
        errors.push(ValidationError::EmptyLogName);
    }
    if logging::parse_level(&observability.log_level).is_err() {
        errors.push(ValidationError::InvalidLogLevel(observability.log_level.clone()));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if config.shutdown.deadline_ms == 0 {
        errors.push(ValidationError::ZeroDeadline);
    }

    if matches!(config.keys.prefix.as_deref(), Some(p) if p.is_empty()) {
        errors.push(ValidationError::EmptyPrefix);
    }

    let mut labels = HashSet::new();
    for conn in &config.connections {
        if conn.label.is_empty() {
            errors.push(ValidationError::EmptyLabel);
        } else if !labels.insert(conn.label.as_str()) {
            errors.push(ValidationError::DuplicateLabel(conn.label.clone()));
        }

        match Url::parse(&conn.uri) {
            Ok(uri) if !SUPPORTED_SCHEMES.contains(&uri.scheme()) => {
                errors.push(ValidationError::UnsupportedScheme {
                    label: conn.label.clone(),
                    scheme: uri.scheme().to_string(),
                });
            }
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::InvalidUri {
                label: conn.label.clone(),
                uri: conn.uri.clone(),
            }),
        }
    }

    for sub in &config.subscriptions {
        if !labels.contains(sub.label.as_str()) {
            errors.push(ValidationError::UnknownSubscriptionLabel(sub.label.clone()));
        }
        if sub.channels.iter().any(|c| c.is_empty()) {
            errors.push(ValidationError::EmptyChannel(sub.label.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
