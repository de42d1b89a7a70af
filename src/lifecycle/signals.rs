//! OS signal handling.
//!
//! # Responsibilities
//! - Listen for SIGINT, SIGQUIT and SIGTERM (Ctrl-C off unix)
//! - Translate the first one into a coordinator trigger with a reason
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The listener task ends after one signal; the coordinator's
//!   `listeners_attached` flag guards against late deliveries

use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::lifecycle::ExitCoordinator;

/// Install termination listeners that trigger `coordinator` once.
///
/// Must be called from within a Tokio runtime.
#[cfg(unix)]
pub fn spawn_listeners(coordinator: Arc<ExitCoordinator>) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    coordinator.attach_listeners();
    tracing::debug!("Termination signal listeners installed");

    Ok(tokio::spawn(async move {
        let reason = tokio::select! {
            _ = interrupt.recv() => "SIGINT caught",
            _ = quit.recv() => "SIGQUIT caught",
            _ = terminate.recv() => "SIGTERM caught",
        };
        deliver(&coordinator, reason).await;
    }))
}

#[cfg(not(unix))]
pub fn spawn_listeners(coordinator: Arc<ExitCoordinator>) -> io::Result<JoinHandle<()>> {
    coordinator.attach_listeners();
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            deliver(&coordinator, "SIGINT caught").await;
        }
    }))
}

async fn deliver(coordinator: &ExitCoordinator, reason: &str) {
    if !coordinator.listeners_attached() {
        tracing::debug!(reason, "Listeners detached, ignoring termination signal");
        return;
    }
    coordinator.trigger(reason).await;
}
