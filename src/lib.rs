//! Pub/sub connection pool with coordinated process shutdown.

pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod pubsub;

pub use config::AppConfig;
pub use lifecycle::{ExitCoordinator, ExitOutcome, ExitReport};
pub use pubsub::{MessageHandler, PubSubClient, PubSubError};
