//! Pub/sub types and error definitions.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::BackendError;

/// Label used when the caller does not name a connection.
pub const DEFAULT_CONNECTION_LABEL: &str = "main";

/// Errors surfaced by the pool, the multiplexer and the client.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The connection URI could not be parsed.
    #[error("invalid connection uri '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    /// The broker refused or dropped the connection attempt.
    #[error("failed to connect '{label}': {source}")]
    Connection {
        label: String,
        #[source]
        source: BackendError,
    },

    /// No live connection is stored under this label.
    #[error("No connected database for label: \"{label}\"")]
    NoConnection { label: String },

    /// Closing the physical connection failed.
    #[error("failed to close '{label}': {source}")]
    Close {
        label: String,
        #[source]
        source: BackendError,
    },

    /// A bounded list must keep at least one entry.
    #[error("bounded list length must be at least 1")]
    InvalidMaxLength,

    /// A command on a live connection failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The value could not be serialized to text.
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for pub/sub operations.
pub type PubSubResult<T> = Result<T, PubSubError>;

type HandlerFn = dyn Fn(&str, &str) + Send + Sync;

/// A subscriber callback, invoked with `(channel, message)`.
///
/// Identity is the allocation: clones compare equal, two handlers built from
/// the same closure code do not.
#[derive(Clone)]
pub struct MessageHandler(Arc<HandlerFn>);

impl MessageHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, channel: &str, message: &str) {
        (self.0)(channel, message)
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for MessageHandler {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for MessageHandler {}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageHandler").field(&self.addr()).finish()
    }
}
