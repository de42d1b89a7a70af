//! Scheme based driver selection.
//!
//! Lets one pool hold `redis://` and `memory://` connections side by side.

use tokio::sync::mpsc;
use url::Url;

use crate::backend::memory::{MemoryConnection, MemoryConnector};
use crate::backend::resp::{RespConnection, RespConnector};
use crate::backend::{BackendError, BackendResult, BrokerConnection, Connector, InboundMessage};

/// Picks the driver from the URI scheme.
#[derive(Debug, Clone, Default)]
pub struct SchemeConnector {
    pub resp: RespConnector,
    pub memory: MemoryConnector,
}

impl SchemeConnector {
    pub fn new(resp: RespConnector, memory: MemoryConnector) -> Self {
        Self { resp, memory }
    }
}

impl Connector for SchemeConnector {
    type Conn = SchemeConnection;

    async fn connect(&self, uri: &Url) -> BackendResult<SchemeConnection> {
        match uri.scheme() {
            "redis" => self.resp.connect(uri).await.map(SchemeConnection::Resp),
            "memory" => self.memory.connect(uri).await.map(SchemeConnection::Memory),
            other => Err(BackendError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Connection opened by a [`SchemeConnector`].
#[derive(Debug)]
pub enum SchemeConnection {
    Resp(RespConnection),
    Memory(MemoryConnection),
}

impl BrokerConnection for SchemeConnection {
    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<i64> {
        match self {
            SchemeConnection::Resp(conn) => conn.publish(channel, payload).await,
            SchemeConnection::Memory(conn) => conn.publish(channel, payload).await,
        }
    }

    async fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> BackendResult<()> {
        match self {
            SchemeConnection::Resp(conn) => conn.push_bounded(key, value, max_len).await,
            SchemeConnection::Memory(conn) => conn.push_bounded(key, value, max_len).await,
        }
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<()> {
        match self {
            SchemeConnection::Resp(conn) => conn.subscribe(channel).await,
            SchemeConnection::Memory(conn) => conn.subscribe(channel).await,
        }
    }

    async fn unsubscribe(&self, channel: &str) -> BackendResult<()> {
        match self {
            SchemeConnection::Resp(conn) => conn.unsubscribe(channel).await,
            SchemeConnection::Memory(conn) => conn.unsubscribe(channel).await,
        }
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        match self {
            SchemeConnection::Resp(conn) => conn.take_messages(),
            SchemeConnection::Memory(conn) => conn.take_messages(),
        }
    }

    async fn close(&self) -> BackendResult<()> {
        match self {
            SchemeConnection::Resp(conn) => conn.close().await,
            SchemeConnection::Memory(conn) => conn.close().await,
        }
    }
}
