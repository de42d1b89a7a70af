//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → handed to logging, the exit coordinator and the pub/sub client
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the key prefix in particular is fixed
//!   for the lifetime of the process
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::AppConfig;
pub use schema::ConnectionConfig;
pub use schema::KeyConfig;
pub use schema::ObservabilityConfig;
pub use schema::ShutdownConfig;
pub use schema::SubscriptionConfig;
pub use validation::{validate_config, ValidationError};
