//! Pub/sub connection pool and subscription fan-out.
//!
//! # Data Flow
//! ```text
//! PubSubClient::connect(label, uri)
//!     → pool.rs (one physical connection per label, per-label connect gate)
//!         → ExitCoordinator::register(disconnect hook)
//!
//! PubSubClient::publish / push(label, key, …)
//!     → prefix.rs ("<prefix>:<key>")
//!     → pool.rs (live connection or NoConnection)
//!
//! PubSubClient::subscribe(label, channels, handler)
//!     → multiplexer.rs (refcount per (label, channel))
//!         - 0 → 1: physical SUBSCRIBE "<prefix>:<channel>"
//!         - always: append handler
//!     → one listener task per label drains inbound messages
//!         → strip prefix → invoke handlers of the bare channel
//! ```
//!
//! # Design Decisions
//! - One client context per process, passed explicitly
//! - Check-then-act paths (connect, refcount + physical command) are
//!   serialised per label with async mutexes
//! - Physical command first, bookkeeping second: a failed SUBSCRIBE or
//!   UNSUBSCRIBE leaves the refcount untouched

pub mod client;
pub mod multiplexer;
pub mod pool;
pub mod prefix;
pub mod types;

pub use client::PubSubClient;
pub use multiplexer::SubscriptionMultiplexer;
pub use pool::ConnectionPool;
pub use prefix::KeyPrefix;
pub use types::{MessageHandler, PubSubError, PubSubResult, DEFAULT_CONNECTION_LABEL};
