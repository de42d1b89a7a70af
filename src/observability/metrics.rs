//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pubsub_connections_open` (gauge): 1 while a label holds a live connection
//! - `pubsub_connects_total` (counter): physical connect attempts by label, result
//! - `pubsub_physical_commands_total` (counter): SUBSCRIBE, UNSUBSCRIBE and
//!   bounded pushes sent to the broker
//! - `pubsub_messages_dispatched_total` (counter): inbound messages by label
//! - `shutdown_hooks_total` (counter): hook results by status

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::lifecycle::HookStatus;

/// Install the Prometheus recorder with an HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connect(label: &str, success: bool) {
    let result = if success { "ok" } else { "error" };
    metrics::counter!("pubsub_connects_total", "label" => label.to_string(), "result" => result)
        .increment(1);
    if success {
        metrics::gauge!("pubsub_connections_open", "label" => label.to_string()).set(1.0);
    }
}

pub fn record_disconnect(label: &str) {
    metrics::gauge!("pubsub_connections_open", "label" => label.to_string()).set(0.0);
}

/// `op` is `"subscribe"`, `"unsubscribe"` or `"push"`.
pub fn record_physical_command(label: &str, op: &'static str) {
    metrics::counter!("pubsub_physical_commands_total", "label" => label.to_string(), "op" => op)
        .increment(1);
}

pub fn record_dispatch(label: &str) {
    metrics::counter!("pubsub_messages_dispatched_total", "label" => label.to_string())
        .increment(1);
}

pub fn record_hook_status(status: &HookStatus) {
    let status = match status {
        HookStatus::Succeeded => "succeeded",
        HookStatus::Failed(_) => "failed",
        HookStatus::Abandoned => "abandoned",
    };
    metrics::counter!("shutdown_hooks_total", "status" => status).increment(1);
}
