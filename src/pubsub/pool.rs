//! Labeled broker connection pool.
//!
//! # Responsibilities
//! - Hold at most one live connection per label
//! - Establish connections lazily and reuse them on later calls
//! - Register a disconnect hook with the exit coordinator for every new connection
//!
//! # Design Decisions
//! - A per-label async gate serialises connect/disconnect, so concurrent
//!   callers never open two physical connections for one label
//! - Connect failures leave nothing behind; the caller may retry
//! - Hooks hold weak references and only close the exact handle they were
//!   registered for

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use url::Url;

use crate::backend::{BrokerConnection, Connector};
use crate::lifecycle::{ExitCoordinator, HookError};
use crate::observability::metrics;
use crate::pubsub::types::{PubSubError, PubSubResult};

struct PoolInner<C: Connector> {
    connector: C,
    /// Map of label -> live connection.
    connections: DashMap<String, Arc<C::Conn>>,
    /// Map of label -> connect/disconnect gate.
    gates: DashMap<String, Arc<Mutex<()>>>,
    coordinator: Arc<ExitCoordinator>,
}

/// Pool of broker connections keyed by label.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, coordinator: Arc<ExitCoordinator>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                connections: DashMap::new(),
                gates: DashMap::new(),
                coordinator,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Live connection for `label`.
    pub fn get(&self, label: &str) -> PubSubResult<Arc<C::Conn>> {
        self.lookup(label).ok_or_else(|| PubSubError::NoConnection {
            label: label.to_string(),
        })
    }

    pub fn is_connected(&self, label: &str) -> bool {
        self.inner.connections.contains_key(label)
    }

    /// Labels with a live connection.
    pub fn labels(&self) -> Vec<String> {
        self.inner.connections.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    fn lookup(&self, label: &str) -> Option<Arc<C::Conn>> {
        self.inner.connections.get(label).map(|r| r.value().clone())
    }

    async fn gate(&self, label: &str) -> OwnedMutexGuard<()> {
        let gate = self
            .inner
            .gates
            .entry(label.to_string())
            .or_default()
            .clone();
        gate.lock_owned().await
    }

    /// Return the connection for `label`, opening it to `uri` if needed.
    pub async fn connect(&self, label: &str, uri: &str) -> PubSubResult<Arc<C::Conn>> {
        if let Some(conn) = self.lookup(label) {
            return Ok(conn);
        }

        let parsed = Url::parse(uri).map_err(|source| PubSubError::InvalidUri {
            uri: uri.to_string(),
            source,
        })?;

        let _gate = self.gate(label).await;
        // Another caller may have connected while we waited for the gate.
        if let Some(conn) = self.lookup(label) {
            return Ok(conn);
        }

        match self.inner.connector.connect(&parsed).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                self.inner
                    .connections
                    .insert(label.to_string(), conn.clone());
                self.register_disconnect_hook(label, uri, &conn);
                metrics::record_connect(label, true);
                tracing::info!(label = %label, uri = %uri, "Connected to broker");
                Ok(conn)
            }
            Err(source) => {
                metrics::record_connect(label, false);
                tracing::warn!(
                    label = %label,
                    uri = %uri,
                    error = %source,
                    "Broker connection failed"
                );
                Err(PubSubError::Connection {
                    label: label.to_string(),
                    source,
                })
            }
        }
    }

    fn register_disconnect_hook(&self, label: &str, uri: &str, conn: &Arc<C::Conn>) {
        let pool: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        let handle = Arc::downgrade(conn);
        let hook_label = label.to_string();
        let uri = uri.to_string();

        let accepted = self.inner.coordinator.register(move || async move {
            let (Some(inner), Some(handle)) = (pool.upgrade(), handle.upgrade()) else {
                return Ok(());
            };
            tracing::info!("Disconnecting from broker[{}]: {}", hook_label, uri);
            ConnectionPool { inner }
                .disconnect_handle(&hook_label, &handle)
                .await
                .map_err(HookError::failed)
        });
        if !accepted {
            tracing::warn!(
                label = %label,
                "Connected during shutdown; no disconnect hook registered"
            );
        }
    }

    /// Close and remove the connection for `label`. No-op when absent.
    pub async fn disconnect(&self, label: &str) -> PubSubResult<()> {
        let _gate = self.gate(label).await;
        let Some((_, conn)) = self.inner.connections.remove(label) else {
            return Ok(());
        };
        self.close(label, conn).await
    }

    /// Close `handle` only if it is still the live connection for `label`.
    async fn disconnect_handle(&self, label: &str, handle: &Arc<C::Conn>) -> PubSubResult<()> {
        let _gate = self.gate(label).await;
        let removed = self
            .inner
            .connections
            .remove_if(label, |_, live| Arc::ptr_eq(live, handle));
        match removed {
            Some((_, conn)) => self.close(label, conn).await,
            None => Ok(()),
        }
    }

    async fn close(&self, label: &str, conn: Arc<C::Conn>) -> PubSubResult<()> {
        metrics::record_disconnect(label);
        match conn.close().await {
            Ok(()) => {
                tracing::info!(label = %label, "Disconnected from broker");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(label = %label, error = %source, "Broker close failed");
                Err(PubSubError::Close {
                    label: label.to_string(),
                    source,
                })
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("labels", &self.labels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use std::time::Duration;

    fn pool() -> (ConnectionPool<MemoryConnector>, Arc<ExitCoordinator>) {
        let coordinator = Arc::new(ExitCoordinator::new(Duration::from_secs(1)));
        (
            ConnectionPool::new(MemoryConnector::default(), coordinator.clone()),
            coordinator,
        )
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() {
        let (pool, coordinator) = pool();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.connect("main", "memory://test").await })
            })
            .collect();

        let mut ids = Vec::new();
        for attempt in attempts {
            ids.push(attempt.await.unwrap().unwrap().id());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(pool.connector().connect_attempts(), 1);
        assert_eq!(coordinator.hook_count(), 1);
    }

    #[tokio::test]
    async fn invalid_uri_is_rejected_before_connecting() {
        let (pool, _) = pool();
        let err = pool.connect("main", "not a uri").await.unwrap_err();

        assert!(matches!(err, PubSubError::InvalidUri { .. }));
        assert_eq!(pool.connector().connect_attempts(), 0);
    }

    #[tokio::test]
    async fn stale_hook_leaves_new_connection_alone() {
        let (pool, _) = pool();
        let first = pool.connect("main", "memory://test").await.unwrap();
        pool.disconnect("main").await.unwrap();
        let second = pool.connect("main", "memory://test").await.unwrap();

        pool.disconnect_handle("main", &first).await.unwrap();

        assert!(pool.is_connected("main"));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn close_failure_is_surfaced_and_entry_removed() {
        let (pool, _) = pool();
        pool.connector().set_fail_close(true);
        pool.connect("main", "memory://test").await.unwrap();

        let err = pool.disconnect("main").await.unwrap_err();

        assert!(matches!(err, PubSubError::Close { .. }));
        assert!(!pool.is_connected("main"));
    }
}
