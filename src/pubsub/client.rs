//! Process-wide pub/sub context.
//!
//! # Responsibilities
//! - Own the connection pool, the subscription multiplexer and the key prefix
//! - Apply the prefix to every key and channel on the way out
//! - Resolve labels to live connections for publish, push and subscribe

use std::sync::Arc;

use serde::Serialize;

use crate::backend::{BrokerConnection, Connector};
use crate::lifecycle::ExitCoordinator;
use crate::observability::metrics;
use crate::pubsub::multiplexer::SubscriptionMultiplexer;
use crate::pubsub::pool::ConnectionPool;
use crate::pubsub::prefix::KeyPrefix;
use crate::pubsub::types::{MessageHandler, PubSubError, PubSubResult};

/// Entry point for connections, publishing, bounded lists and subscriptions.
///
/// Cloning is cheap and every clone shares the same state.
pub struct PubSubClient<C: Connector> {
    pool: ConnectionPool<C>,
    mux: Arc<SubscriptionMultiplexer>,
    prefix: Arc<KeyPrefix>,
}

impl<C: Connector> Clone for PubSubClient<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            mux: self.mux.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<C: Connector> PubSubClient<C> {
    pub fn new(connector: C, coordinator: Arc<ExitCoordinator>) -> Self {
        Self::with_prefix(connector, coordinator, None)
    }

    pub fn with_prefix(
        connector: C,
        coordinator: Arc<ExitCoordinator>,
        prefix: Option<String>,
    ) -> Self {
        let prefix = Arc::new(KeyPrefix::new(prefix));
        Self {
            pool: ConnectionPool::new(connector, coordinator),
            mux: Arc::new(SubscriptionMultiplexer::new(prefix.clone())),
            prefix,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.mux
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    /// Open (or reuse) the connection for `label`.
    pub async fn connect(&self, label: &str, uri: &str) -> PubSubResult<Arc<C::Conn>> {
        self.pool.connect(label, uri).await
    }

    /// Close the connection for `label` and drop its subscriptions.
    pub async fn disconnect(&self, label: &str) -> PubSubResult<()> {
        self.mux.forget(label).await;
        self.pool.disconnect(label).await
    }

    /// Publish `message` on the prefixed `channel`, returning the receiver count.
    pub async fn publish(&self, label: &str, channel: &str, message: &str) -> PubSubResult<i64> {
        let conn = self.pool.get(label)?;
        let receivers = conn.publish(&self.prefix.prefix(channel), message).await?;
        tracing::trace!(label = %label, channel = %channel, receivers, "Published");
        Ok(receivers)
    }

    /// Publish `value` serialized as JSON.
    pub async fn publish_json<T>(&self, label: &str, channel: &str, value: &T) -> PubSubResult<i64>
    where
        T: Serialize + ?Sized,
    {
        let message = serde_json::to_string(value)?;
        self.publish(label, channel, &message).await
    }

    /// Prepend `value` to the prefixed list `key`, keeping at most `max_len` entries.
    pub async fn push(
        &self,
        label: &str,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> PubSubResult<()> {
        if max_len == 0 {
            return Err(PubSubError::InvalidMaxLength);
        }
        let conn = self.pool.get(label)?;
        conn.push_bounded(&self.prefix.prefix(key), value, max_len).await?;
        metrics::record_physical_command(label, "push");
        Ok(())
    }

    /// [`push`](Self::push) with `value` serialized as JSON.
    pub async fn push_json<T>(
        &self,
        label: &str,
        key: &str,
        value: &T,
        max_len: usize,
    ) -> PubSubResult<()>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_string(value)?;
        self.push(label, key, &value, max_len).await
    }

    /// Register `handler` on each of `channels`.
    pub async fn subscribe<I, S>(
        &self,
        label: &str,
        channels: I,
        handler: &MessageHandler,
    ) -> PubSubResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let conn = self.pool.get(label)?;
        self.mux.subscribe(label, &*conn, channels, handler).await
    }

    /// Remove one registration of `handler` from each of `channels`.
    pub async fn unsubscribe<I, S>(
        &self,
        label: &str,
        channels: I,
        handler: &MessageHandler,
    ) -> PubSubResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let conn = self.pool.get(label)?;
        self.mux.unsubscribe(label, &*conn, channels, handler).await
    }

    /// Replace the key prefix, returning the new value.
    pub fn set_prefix(&self, prefix: Option<String>) -> Option<String> {
        tracing::debug!(prefix = ?prefix, "Key prefix changed");
        self.prefix.set_prefix(prefix)
    }

    /// `key` with the current prefix applied.
    pub fn prefix(&self, key: &str) -> String {
        self.prefix.prefix(key)
    }
}

impl<C: Connector> std::fmt::Debug for PubSubClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubClient")
            .field("pool", &self.pool)
            .field("mux", &self.mux)
            .field("prefix", &self.prefix)
            .finish()
    }
}
