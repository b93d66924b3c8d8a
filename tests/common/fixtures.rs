// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload fixtures and listener helpers.

use reliable_topic::{ListenerKind, Payload, ReliableTopic, TopicConfig, TopicStore};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderEventKind {
    OrderCreated,
    Text,
}

/// Heterogeneous payloads sharing one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated { id: u64 },
    Text(String),
}

impl Payload for OrderEvent {
    type Kind = OrderEventKind;

    fn kind(&self) -> OrderEventKind {
        match self {
            OrderEvent::OrderCreated { .. } => OrderEventKind::OrderCreated,
            OrderEvent::Text(_) => OrderEventKind::Text,
        }
    }
}

pub fn order(id: u64) -> OrderEvent {
    OrderEvent::OrderCreated { id }
}

/// Config with a short watchdog so lease expiry fits in a test.
pub fn fast_config(watchdog: &str) -> TopicConfig {
    TopicConfig::for_testing(watchdog)
}

/// Register a listener that forwards every matching message to a channel.
pub async fn channel_listener<S: TopicStore>(
    topic: &ReliableTopic<OrderEvent, S>,
    kind: impl Into<ListenerKind<OrderEventKind>>,
) -> (String, mpsc::UnboundedReceiver<OrderEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = topic
        .add_listener(kind, move |_topic: &str, event: &OrderEvent| {
            let _ = tx.send(event.clone());
        })
        .await
        .expect("add_listener");
    (id, rx)
}

/// Receive the next message or fail after `timeout`.
pub async fn recv_within(rx: &mut mpsc::UnboundedReceiver<OrderEvent>, timeout: Duration) -> OrderEvent {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("listener channel closed")
}

/// Assert nothing arrives within `window`.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<OrderEvent>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected delivery: {:?}", event);
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Install a test tracing subscriber once (RUST_LOG controls verbosity).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
