//! pubsub-lifecycle daemon
//!
//! Opens the configured broker connections, logs traffic on the configured
//! channels and shuts down cleanly on SIGINT, SIGQUIT or SIGTERM.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!                  │               pubsub-lifecycle               │
//!                  │                                              │
//!   config.toml ───┼─▶ config ──▶ observability (tracing/metrics) │
//!                  │                                              │
//!                  │   pubsub::PubSubClient                       │
//!                  │     ├─ pool ─────────▶ backend ──────────────┼──▶ broker
//!                  │     ├─ multiplexer ◀── inbound messages ◀────┼─── broker
//!                  │     └─ prefix                                │
//!                  │            │ disconnect hooks                │
//!                  │            ▼                                 │
//!   signals ───────┼─▶ lifecycle::ExitCoordinator ──▶ exit code   │
//!                  └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::Instrument;

use pubsub_lifecycle::backend::SchemeConnector;
use pubsub_lifecycle::config::{load_config, AppConfig};
use pubsub_lifecycle::lifecycle::{signals, startup};
use pubsub_lifecycle::observability::{logging, metrics};
use pubsub_lifecycle::{ExitCoordinator, PubSubClient};

#[derive(Parser)]
#[command(name = "pubsub-lifecycle")]
#[command(about = "Labeled pub/sub connections with coordinated shutdown", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    if let Some(level) = cli.log_level {
        logging::parse_level(&level)?;
        config.observability.log_level = level;
    }

    let span = logging::init(&config.observability)?;
    run(config).instrument(span).await
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("pubsub-lifecycle v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        connections = config.connections.len(),
        subscriptions = config.subscriptions.len(),
        deadline_ms = config.shutdown.deadline_ms,
        prefix = ?config.keys.prefix,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let coordinator = Arc::new(ExitCoordinator::from_config(&config.shutdown));
    signals::spawn_listeners(coordinator.clone())?;

    let client = PubSubClient::with_prefix(
        SchemeConnector::default(),
        coordinator.clone(),
        config.keys.prefix.clone(),
    );

    startup::start(&client, &coordinator, &config).await?;

    let report = coordinator.wait().await;
    tracing::info!(reason = %report.reason, code = report.code(), "Shutdown complete");
    Ok(())
}
