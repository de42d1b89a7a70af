//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::pubsub::DEFAULT_CONNECTION_LABEL;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Logger and metrics settings.
    pub observability: ObservabilityConfig,

    /// Cleanup deadline.
    pub shutdown: ShutdownConfig,

    /// Key/channel namespace.
    pub keys: KeyConfig,

    /// Broker connections opened at startup.
    pub connections: Vec<ConnectionConfig>,

    /// Channels whose traffic is logged by the daemon.
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logger name, attached to every event through the root span.
    pub log_name: String,

    /// Log level (fatal, error, warn, info, debug, trace).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_name: "pubsub-lifecycle".to_string(),
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time budget for all cleanup hooks together, in milliseconds.
    pub deadline_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { deadline_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct KeyConfig {
    /// Prepended as `<prefix>:` to every key and channel.
    pub prefix: Option<String>,
}

/// A broker connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_label")]
    pub label: String,

    /// `redis://host[:port]` or `memory://name`. Memory names are labels only;
    /// every `memory://` URI reaches the same in-process broker.
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_label")]
    pub label: String,

    pub channels: Vec<String>,
}

fn default_label() -> String {
    DEFAULT_CONNECTION_LABEL.to_string()
}
