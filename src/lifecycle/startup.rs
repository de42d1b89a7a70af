//! Startup orchestration.
//!
//! # Responsibilities
//! - Open every configured connection, then install every configured subscription
//! - Route a startup failure through the exit coordinator so connections that
//!   were already opened get closed by their hooks
//!
//! # Design Decisions
//! - Fail fast: the first connect or subscribe error ends startup
//! - Subscriptions start only once every connection is up

use crate::backend::Connector;
use crate::config::AppConfig;
use crate::lifecycle::ExitCoordinator;
use crate::pubsub::{MessageHandler, PubSubClient, PubSubResult};

/// Bring up the connections and subscriptions listed in `config`.
///
/// On failure the coordinator is triggered before the error is returned.
pub async fn start<C: Connector>(
    client: &PubSubClient<C>,
    coordinator: &ExitCoordinator,
    config: &AppConfig,
) -> PubSubResult<()> {
    for conn in &config.connections {
        if let Err(e) = client.connect(&conn.label, &conn.uri).await {
            tracing::error!(label = %conn.label, error = %e, "Startup connection failed");
            coordinator.trigger("startup connection failed").await;
            return Err(e);
        }
    }

    for sub in &config.subscriptions {
        let handler = logging_handler(&sub.label);
        if let Err(e) = client.subscribe(&sub.label, &sub.channels, &handler).await {
            tracing::error!(
                label = %sub.label,
                channels = ?sub.channels,
                error = %e,
                "Startup subscription failed"
            );
            coordinator.trigger("startup subscription failed").await;
            return Err(e);
        }
        tracing::info!(label = %sub.label, channels = ?sub.channels, "Subscribed");
    }
    Ok(())
}

fn logging_handler(label: &str) -> MessageHandler {
    let label = label.to_string();
    MessageHandler::new(move |channel, message| {
        tracing::info!(label = %label, channel = %channel, message = %message, "Message received");
    })
}
