//! In-process broker.
//!
//! # Responsibilities
//! - Serve `memory://` URIs without any network I/O
//! - Implement PUBLISH, SUBSCRIBE/UNSUBSCRIBE and bounded LPUSH semantics
//! - Record physical command counts so callers can observe pool behaviour

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use url::Url;

use crate::backend::{BackendError, BackendResult, BrokerConnection, Connector, InboundMessage};

static MEMORY_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct BrokerState {
    lists: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<InboundMessage>)>>,
    subscribe_commands: HashMap<String, usize>,
    unsubscribe_commands: HashMap<String, usize>,
}

/// Shared broker state. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Contents of the list at `key`, most recent first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of physical SUBSCRIBE commands received for `channel`.
    pub fn subscribe_commands(&self, channel: &str) -> usize {
        self.lock().subscribe_commands.get(channel).copied().unwrap_or(0)
    }

    /// Number of physical UNSUBSCRIBE commands received for `channel`.
    pub fn unsubscribe_commands(&self, channel: &str) -> usize {
        self.lock().unsubscribe_commands.get(channel).copied().unwrap_or(0)
    }

    /// Number of connections currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().subscribers.get(channel).map(Vec::len).unwrap_or(0)
    }

    /// Deliver `payload` to every subscriber of `channel`, as another client would.
    pub fn publish(&self, channel: &str, payload: &str) -> i64 {
        let state = self.lock();
        let Some(subscribers) = state.subscribers.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for (_, tx) in subscribers {
            let message = InboundMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn push_bounded(&self, key: &str, value: &str, max_len: usize) {
        let mut state = self.lock();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(max_len);
        if list.is_empty() {
            state.lists.remove(key);
        }
    }

    fn subscribe(&self, id: u64, channel: &str, tx: &mpsc::UnboundedSender<InboundMessage>) {
        let mut state = self.lock();
        *state.subscribe_commands.entry(channel.to_string()).or_default() += 1;
        let subscribers = state.subscribers.entry(channel.to_string()).or_default();
        if !subscribers.iter().any(|(sub_id, _)| *sub_id == id) {
            subscribers.push((id, tx.clone()));
        }
    }

    fn unsubscribe(&self, id: u64, channel: &str) {
        let mut state = self.lock();
        *state.unsubscribe_commands.entry(channel.to_string()).or_default() += 1;
        if let Some(subscribers) = state.subscribers.get_mut(channel) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            if subscribers.is_empty() {
                state.subscribers.remove(channel);
            }
        }
    }

    fn drop_connection(&self, id: u64) {
        let mut state = self.lock();
        state.subscribers.retain(|_, subscribers| {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            !subscribers.is_empty()
        });
    }
}

/// Connector for `memory://` URIs.
///
/// The URI host is only a label for logs: every connection this connector
/// opens, whatever its name, talks to the same [`MemoryBroker`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    connect_attempts: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            ..Self::default()
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Number of physical connect attempts, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make subsequent connect attempts fail until reset.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make `close` on connections opened from now on fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, uri: &Url) -> BackendResult<MemoryConnection> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if uri.scheme() != "memory" {
            return Err(BackendError::UnsupportedScheme(uri.scheme().to_string()));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BackendError::Refused(uri.to_string()));
        }

        // Yield so concurrent callers genuinely interleave with the connect.
        tokio::task::yield_now().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = MEMORY_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, uri = %uri, "Memory connection opened");

        Ok(MemoryConnection {
            id,
            broker: self.broker.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            fail_close: self.fail_close.load(Ordering::SeqCst),
        })
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    channels: Mutex<HashSet<String>>,
    closed: AtomicBool,
    fail_close: bool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.is_closed() {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    fn channels(&self) -> MutexGuard<'_, HashSet<String>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BrokerConnection for MemoryConnection {
    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<i64> {
        self.ensure_open()?;
        Ok(self.broker.publish(channel, payload))
    }

    async fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> BackendResult<()> {
        self.ensure_open()?;
        self.broker.push_bounded(key, value, max_len);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<()> {
        self.ensure_open()?;
        self.broker.subscribe(self.id, channel, &self.tx);
        self.channels().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> BackendResult<()> {
        self.ensure_open()?;
        self.broker.unsubscribe(self.id, channel);
        self.channels().remove(channel);
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn close(&self) -> BackendResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.drop_connection(self.id);
        self.channels().clear();
        if self.fail_close {
            return Err(BackendError::Server("close rejected".to_string()));
        }
        tracing::debug!(connection_id = self.id, "Memory connection closed");
        Ok(())
    }
}
