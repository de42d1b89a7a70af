//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (connection gauges, subscription and hook counters)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config level)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Logger name and level come from config, validated up front
//! - `fatal` is accepted as a level name and maps onto ERROR
//! - Metric updates go through the `metrics` facade; no recorder means no cost

pub mod logging;
pub mod metrics;
