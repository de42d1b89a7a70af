//! Broker drivers.
//!
//! # Data Flow
//! ```text
//! ConnectionPool::connect(label, uri)
//!     → Connector::connect(uri)
//!         - memory.rs (memory://name, in-process broker)
//!         - resp.rs   (redis://host:port, RESP2 over TCP)
//!         - dispatch.rs (either of the above, chosen by scheme)
//!     → BrokerConnection (one physical connection)
//!
//! Inbound pub/sub traffic:
//!     BrokerConnection::take_messages() → mpsc receiver
//!     → SubscriptionMultiplexer listener task (one per label)
//! ```
//!
//! # Design Decisions
//! - Drivers know nothing about labels, prefixes or refcounts
//! - Every driver call is a single round trip; no retries here
//! - The inbound message stream can be taken exactly once per connection

pub mod dispatch;
pub mod memory;
pub mod resp;

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub use dispatch::{SchemeConnection, SchemeConnector};
pub use memory::{MemoryBroker, MemoryConnection, MemoryConnector};
pub use resp::{RespConnection, RespConnector};

/// A message received on a subscribed channel, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Wire channel name (still prefixed).
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

/// Errors raised by a broker driver.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Socket level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the driver could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The broker answered with an error reply.
    #[error("broker error: {0}")]
    Server(String),

    /// No driver handles this URI scheme.
    #[error("unsupported URI scheme '{0}'")]
    UnsupportedScheme(String),

    /// The broker refused the connection attempt.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The connection has already been closed.
    #[error("connection closed")]
    Closed,

    /// Regular commands are not allowed once the connection has subscriptions.
    #[error("connection is in subscriber mode")]
    SubscriberMode,
}

/// Result type for driver operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Opens physical connections.
pub trait Connector: Send + Sync + 'static {
    type Conn: BrokerConnection;

    /// Open a new physical connection to `uri`.
    fn connect(&self, uri: &Url) -> impl Future<Output = BackendResult<Self::Conn>> + Send;
}

/// One physical connection to a pub/sub capable broker.
pub trait BrokerConnection: Send + Sync + 'static {
    /// PUBLISH `payload` on `channel`, returning the number of receivers.
    fn publish(
        &self,
        channel: &str,
        payload: &str,
    ) -> impl Future<Output = BackendResult<i64>> + Send;

    /// LPUSH `value` onto `key` then LTRIM it to `max_len` entries, atomically.
    fn push_bounded(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> impl Future<Output = BackendResult<()>> + Send;

    /// Physical SUBSCRIBE.
    fn subscribe(&self, channel: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// Physical UNSUBSCRIBE.
    fn unsubscribe(&self, channel: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// Take the stream of inbound messages. Returns `None` after the first call.
    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>>;

    /// Close the connection.
    fn close(&self) -> impl Future<Output = BackendResult<()>> + Send;
}
