//! Refcounted subscription fan-out.
//!
//! # Responsibilities
//! - Share one physical subscription per (label, channel) between any number
//!   of logical subscribers
//! - Issue SUBSCRIBE on the 0 → 1 transition and UNSUBSCRIBE on 1 → 0 only
//! - Run one listener per label and dispatch inbound messages by bare channel

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{BrokerConnection, InboundMessage};
use crate::observability::metrics;
use crate::pubsub::prefix::KeyPrefix;
use crate::pubsub::types::{MessageHandler, PubSubResult};

type HandlerMap = HashMap<String, Vec<MessageHandler>>;

#[derive(Default)]
struct ChannelCounts {
    /// Map of bare channel -> number of logical subscriptions.
    counts: HashMap<String, usize>,
    listener: Option<JoinHandle<()>>,
}

/// Subscription state of one connection label.
struct LabelTable {
    /// Serialises refcount changes with the physical command they imply.
    counts: Mutex<ChannelCounts>,
    /// Read by the listener task on every inbound message.
    handlers: Arc<RwLock<HandlerMap>>,
}

impl LabelTable {
    fn new() -> Self {
        Self {
            counts: Mutex::new(ChannelCounts::default()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Per-label subscription multiplexer.
#[derive(Default)]
pub struct SubscriptionMultiplexer {
    prefix: Arc<KeyPrefix>,
    labels: DashMap<String, Arc<LabelTable>>,
}

impl SubscriptionMultiplexer {
    pub fn new(prefix: Arc<KeyPrefix>) -> Self {
        Self {
            prefix,
            labels: DashMap::new(),
        }
    }

    fn table(&self, label: &str) -> Arc<LabelTable> {
        self.labels
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(LabelTable::new()))
            .clone()
    }

    fn existing(&self, label: &str) -> Option<Arc<LabelTable>> {
        self.labels.get(label).map(|r| r.value().clone())
    }

    /// Add `handler` to each channel, subscribing physically on first interest.
    pub async fn subscribe<B, I, S>(
        &self,
        label: &str,
        conn: &B,
        channels: I,
        handler: &MessageHandler,
    ) -> PubSubResult<()>
    where
        B: BrokerConnection,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let table = self.table(label);
        let mut state = table.counts.lock().await;

        if state.listener.is_none() {
            match conn.take_messages() {
                Some(rx) => {
                    state.listener = Some(tokio::spawn(listen(
                        label.to_string(),
                        rx,
                        table.handlers.clone(),
                        self.prefix.clone(),
                    )));
                    tracing::debug!(label = %label, "Subscription listener installed");
                }
                None => {
                    tracing::warn!(
                        label = %label,
                        "Inbound stream already taken; messages will not be dispatched"
                    );
                }
            }
        }

        for channel in channels {
            let channel = channel.as_ref();
            let current = state.counts.get(channel).copied().unwrap_or(0);
            if current == 0 {
                conn.subscribe(&self.prefix.prefix(channel)).await?;
                metrics::record_physical_command(label, "subscribe");
                tracing::debug!(label = %label, channel = %channel, "Subscribed");
            }
            state.counts.insert(channel.to_string(), current + 1);
            write(&table.handlers)
                .entry(channel.to_string())
                .or_default()
                .push(handler.clone());
        }
        Ok(())
    }

    /// Remove one registration of `handler` from each channel, unsubscribing
    /// physically when the last one goes.
    pub async fn unsubscribe<B, I, S>(
        &self,
        label: &str,
        conn: &B,
        channels: I,
        handler: &MessageHandler,
    ) -> PubSubResult<()>
    where
        B: BrokerConnection,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(table) = self.existing(label) else {
            return Ok(());
        };
        let mut state = table.counts.lock().await;

        for channel in channels {
            let channel = channel.as_ref();
            let position = read(&table.handlers)
                .get(channel)
                .and_then(|list| list.iter().position(|h| h == handler));
            let Some(position) = position else {
                continue;
            };

            let current = state.counts.get(channel).copied().unwrap_or(0);
            if current <= 1 {
                conn.unsubscribe(&self.prefix.prefix(channel)).await?;
                metrics::record_physical_command(label, "unsubscribe");
                tracing::debug!(label = %label, channel = %channel, "Unsubscribed");
                state.counts.remove(channel);
            } else {
                state.counts.insert(channel.to_string(), current - 1);
            }

            let mut handlers = write(&table.handlers);
            if let Some(list) = handlers.get_mut(channel) {
                list.remove(position);
                if list.is_empty() {
                    handlers.remove(channel);
                }
            }
        }
        Ok(())
    }

    /// Invoke every handler registered for the message's bare channel.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, label: &str, message: &InboundMessage) -> usize {
        match self.existing(label) {
            Some(table) => dispatch(label, &table.handlers, &self.prefix, message),
            None => 0,
        }
    }

    /// Logical subscription count for (label, channel).
    pub async fn ref_count(&self, label: &str, channel: &str) -> usize {
        match self.existing(label) {
            Some(table) => table.counts.lock().await.counts.get(channel).copied().unwrap_or(0),
            None => 0,
        }
    }

    pub fn handler_count(&self, label: &str, channel: &str) -> usize {
        self.existing(label)
            .map(|table| read(&table.handlers).get(channel).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Drop all state for `label` and stop its listener.
    ///
    /// Used when the label's connection goes away; nothing is sent to the broker.
    pub async fn forget(&self, label: &str) {
        let Some((_, table)) = self.labels.remove(label) else {
            return;
        };
        let mut state = table.counts.lock().await;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        state.counts.clear();
        write(&table.handlers).clear();
        tracing::debug!(label = %label, "Subscription state dropped");
    }
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(|r| r.key().clone()).collect();
        f.debug_struct("SubscriptionMultiplexer")
            .field("prefix", &self.prefix)
            .field("labels", &labels)
            .finish()
    }
}

fn read(handlers: &RwLock<HandlerMap>) -> RwLockReadGuard<'_, HandlerMap> {
    handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(handlers: &RwLock<HandlerMap>) -> RwLockWriteGuard<'_, HandlerMap> {
    handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dispatch(
    label: &str,
    handlers: &RwLock<HandlerMap>,
    prefix: &KeyPrefix,
    message: &InboundMessage,
) -> usize {
    let channel = prefix.strip(&message.channel);
    // Snapshot so handlers run without the lock held.
    let targets = read(handlers).get(channel).cloned().unwrap_or_default();
    metrics::record_dispatch(label);

    for handler in &targets {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.call(channel, &message.payload)
        }));
        if delivered.is_err() {
            tracing::error!(label = %label, channel = %channel, "Message handler panicked");
        }
    }
    targets.len()
}

async fn listen(
    label: String,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    handlers: Arc<RwLock<HandlerMap>>,
    prefix: Arc<KeyPrefix>,
) {
    while let Some(message) = rx.recv().await {
        let delivered = dispatch(&label, &handlers, &prefix, &message);
        tracing::trace!(
            label = %label,
            channel = %message.channel,
            delivered,
            "Message dispatched"
        );
    }
    tracing::debug!(label = %label, "Inbound message stream ended");
}
