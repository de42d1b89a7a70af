//! Pool, multiplexer and client tests against the in-process broker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pubsub_lifecycle::backend::MemoryConnector;
use pubsub_lifecycle::lifecycle::{ExitCoordinator, ExitOutcome};
use pubsub_lifecycle::pubsub::{MessageHandler, PubSubClient, PubSubError};

fn client(
    coordinator: Arc<ExitCoordinator>,
    prefix: Option<&str>,
) -> PubSubClient<MemoryConnector> {
    PubSubClient::with_prefix(MemoryConnector::default(), coordinator, prefix.map(String::from))
}

/// Handler that records every `(channel, message)` it sees.
fn recorder() -> (MessageHandler, Arc<Mutex<Vec<(String, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = MessageHandler::new(move |channel, message| {
        sink.lock().unwrap().push((channel.to_string(), message.to_string()));
    });
    (handler, seen)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn physical_subscriptions_follow_refcount() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator, None);
    client.connect("main", "memory://bus").await.unwrap();
    let broker = client.pool().connector().broker().clone();

    let (first, _) = recorder();
    let (second, _) = recorder();
    client.subscribe("main", ["a", "b"], &first).await.unwrap();
    client.subscribe("main", ["a"], &second).await.unwrap();

    assert_eq!(broker.subscribe_commands("a"), 1);
    assert_eq!(broker.subscribe_commands("b"), 1);
    assert_eq!(client.multiplexer().ref_count("main", "a").await, 2);

    client.unsubscribe("main", ["a"], &first).await.unwrap();
    assert_eq!(broker.unsubscribe_commands("a"), 0);
    assert_eq!(broker.subscriber_count("a"), 1);

    client.unsubscribe("main", ["a", "b"], &second).await.unwrap();
    assert_eq!(broker.unsubscribe_commands("a"), 1);
    assert_eq!(broker.unsubscribe_commands("b"), 0);
    assert_eq!(client.multiplexer().ref_count("main", "b").await, 1);

    client.subscribe("main", ["a"], &second).await.unwrap();
    assert_eq!(broker.subscribe_commands("a"), 2);
}

#[tokio::test]
async fn every_handler_gets_each_message() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator, None);
    client.connect("main", "memory://bus").await.unwrap();

    let (first, first_seen) = recorder();
    let (second, second_seen) = recorder();
    client.subscribe("main", ["jobs"], &first).await.unwrap();
    client.subscribe("main", ["jobs"], &second).await.unwrap();

    client.publish("main", "jobs", "one").await.unwrap();
    settle().await;

    assert_eq!(*first_seen.lock().unwrap(), vec![("jobs".to_string(), "one".to_string())]);
    assert_eq!(*second_seen.lock().unwrap(), vec![("jobs".to_string(), "one".to_string())]);

    client.unsubscribe("main", ["jobs"], &first).await.unwrap();
    client.publish("main", "jobs", "two").await.unwrap();
    settle().await;

    assert_eq!(first_seen.lock().unwrap().len(), 1);
    assert_eq!(second_seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn connections_are_reused_per_label() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator.clone(), None);

    let first = client.connect("main", "memory://bus").await.unwrap();
    let again = client.connect("main", "memory://other").await.unwrap();
    let cache = client.connect("cache", "memory://bus").await.unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_ne!(first.id(), cache.id());
    assert_eq!(client.pool().connector().connect_attempts(), 2);
    assert_eq!(coordinator.hook_count(), 2);

    let mut labels = client.pool().labels();
    labels.sort();
    assert_eq!(labels, vec!["cache", "main"]);
}

#[tokio::test]
async fn prefix_applies_out_and_strips_in() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator, Some("env"));
    client.connect("main", "memory://bus").await.unwrap();
    let broker = client.pool().connector().broker().clone();

    let (handler, seen) = recorder();
    client.subscribe("main", ["env-topic"], &handler).await.unwrap();
    assert_eq!(broker.subscriber_count("env:env-topic"), 1);

    broker.publish("env:env-topic", "payload");
    settle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("env-topic".to_string(), "payload".to_string())]
    );
    assert_eq!(client.prefix("jobs"), "env:jobs");
}

#[tokio::test]
async fn bounded_push_keeps_newest_entries() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator, Some("app"));
    client.connect("main", "memory://bus").await.unwrap();

    for value in ["1", "2", "3", "4", "5"] {
        client.push("main", "recent", value, 3).await.unwrap();
    }

    let broker = client.pool().connector().broker().clone();
    assert_eq!(broker.list("app:recent"), vec!["5", "4", "3"]);
    assert!(broker.list("recent").is_empty());
}

#[tokio::test]
async fn failed_connect_leaves_pool_clean() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator.clone(), None);
    client.pool().connector().set_refuse(true);

    let err = client.connect("main", "memory://bus").await.unwrap_err();
    assert!(matches!(err, PubSubError::Connection { .. }));
    assert!(!client.pool().is_connected("main"));
    assert_eq!(coordinator.hook_count(), 0);

    client.pool().connector().set_refuse(false);
    client.connect("main", "memory://bus").await.unwrap();
    assert!(client.pool().is_connected("main"));
    assert_eq!(coordinator.hook_count(), 1);
}

#[tokio::test]
async fn operations_without_connection_fail() {
    let (coordinator, _) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator, None);
    let (handler, _) = recorder();

    let publish = client.publish("main", "jobs", "x").await.unwrap_err();
    let push = client.push("main", "jobs", "x", 3).await.unwrap_err();
    let subscribe = client.subscribe("main", ["jobs"], &handler).await.unwrap_err();

    for err in [publish, push, subscribe] {
        assert_eq!(err.to_string(), "No connected database for label: \"main\"");
    }
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let (coordinator, terminator) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator.clone(), None);
    let main = client.connect("main", "memory://bus").await.unwrap();
    let cache = client.connect("cache", "memory://bus").await.unwrap();

    let report = coordinator.trigger("SIGTERM caught").await.unwrap();

    assert_eq!(report.outcome, ExitOutcome::Success);
    assert_eq!(report.hooks.len(), 2);
    assert!(main.is_closed());
    assert!(cache.is_closed());
    assert!(client.pool().is_empty());
    assert_eq!(terminator.codes(), vec![0]);
}

#[tokio::test]
async fn close_failure_fails_shutdown() {
    let (coordinator, terminator) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator.clone(), None);
    client.pool().connector().set_fail_close(true);
    client.connect("main", "memory://bus").await.unwrap();

    let report = coordinator.trigger("SIGINT caught").await.unwrap();

    assert_eq!(report.outcome, ExitOutcome::HookFailed);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(terminator.codes(), vec![1]);
}

#[tokio::test]
async fn manual_disconnect_makes_hook_a_no_op() {
    let (coordinator, terminator) = common::coordinator(Duration::from_secs(1));
    let client = client(coordinator.clone(), None);
    client.connect("main", "memory://bus").await.unwrap();

    client.disconnect("main").await.unwrap();
    client.pool().connector().set_fail_close(true);
    let replacement = client.connect("main", "memory://bus").await.unwrap();

    let report = coordinator.trigger("SIGTERM caught").await.unwrap();

    // The stale hook skips; the replacement's hook hits the failing close.
    assert_eq!(report.hooks.len(), 2);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].0, 1);
    assert!(replacement.is_closed());
    assert_eq!(terminator.codes(), vec![1]);
}
