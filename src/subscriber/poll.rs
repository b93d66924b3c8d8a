// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Poll-dispatch loop.
//!
//! One task per elected subscriber, driving an explicit state machine:
//!
//! ```text
//!             empty read
//!            ┌─────────┐
//!            ▼         │
//!   ┌──────► Polling ──┴──── entries ───► Dispatching ───► Reconciling ──┐
//!   │          │                                              │          │
//!   │          │ transport error                 lease alive, │          │
//!   │          ▼                                 listeners    │          │
//!   └────── Backoff ◄──────────── reconcile error ────────────┘          │
//!   │                                                                    │
//!   └────────────────────────────────────────────────────────────────────┘
//!
//!   Stopped: cancelled, lease lost, or still no listeners once the slot
//!   is locked (the subscriber is then marked stopped for retirement)
//! ```
//!
//! There is never more than one outstanding read per subscriber: the next
//! read is issued only after the previous batch was handed to the dispatch
//! pool and reconciliation finished.

use super::SubscriberContext;
use crate::dispatch::deliver_batch;
use crate::error::TopicError;
use crate::listener::Payload;
use crate::metrics;
use crate::store::{epoch_millis, GroupReader, StreamEntry, TopicStore};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// States of the poll-dispatch machine.
#[derive(Debug)]
enum PollState {
    Polling,
    Dispatching(Vec<StreamEntry>),
    Reconciling,
    Backoff,
    Stopped,
}

struct PollLoop<M: Payload, S: TopicStore> {
    ctx: Arc<SubscriberContext<M, S>>,
    subscriber_id: String,
    token: CancellationToken,
    /// Opened lazily; not put back after a failed read, so the next poll reconnects.
    reader: Option<S::Reader>,
}

/// Run the poll loop until it reaches `Stopped`.
pub(crate) async fn run<M: Payload, S: TopicStore>(
    ctx: Arc<SubscriberContext<M, S>>,
    subscriber_id: String,
    token: CancellationToken,
) {
    let mut poll = PollLoop {
        ctx,
        subscriber_id,
        token,
        reader: None,
    };

    debug!("Starting poll loop");
    let mut state = PollState::Polling;
    loop {
        state = match state {
            PollState::Polling => poll.poll().await,
            PollState::Dispatching(entries) => poll.dispatch(entries).await,
            PollState::Reconciling => poll.reconcile().await,
            PollState::Backoff => poll.backoff().await,
            PollState::Stopped => break,
        };
    }
    debug!("Poll loop stopped");
}

impl<M: Payload, S: TopicStore> PollLoop<M, S> {
    async fn poll(&mut self) -> PollState {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => {
                let opened = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return PollState::Stopped,
                    result = self.ctx.store.open_reader(&self.ctx.keys, &self.subscriber_id) => result,
                };
                match opened {
                    Ok(reader) => reader,
                    Err(e) => return self.on_poll_error(e).await,
                }
            }
        };

        let read = tokio::select! {
            biased;
            _ = self.token.cancelled() => return PollState::Stopped,
            result = reader.read(self.ctx.settings.read_count) => result,
        };
        let entries = match read {
            Ok(entries) => {
                self.reader = Some(reader);
                entries
            }
            Err(e) => return self.on_poll_error(e).await,
        };

        if self.ctx.registry.is_empty() && self.ctx.stop_if_idle(&self.subscriber_id, &self.token).await {
            debug!("No listeners left after read, stopping");
            return PollState::Stopped;
        }
        if entries.is_empty() {
            return PollState::Polling;
        }
        metrics::record_messages_read(&self.ctx.name, entries.len());
        PollState::Dispatching(entries)
    }

    async fn dispatch(&mut self, entries: Vec<StreamEntry>) -> PollState {
        let mut messages = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.ctx.codec.decode(&entry.payload) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(stream_id = %entry.id, error = %e, "Skipping undecodable entry");
                    metrics::record_decode_failure(&self.ctx.name);
                }
            }
        }

        if !messages.is_empty() {
            let listeners = self.ctx.registry.snapshot();
            let topic = self.ctx.name.clone();
            trace!(
                messages = messages.len(),
                listeners = listeners.len(),
                pool_available = self.ctx.pool.available(),
                first_id = %entries.first().map(|e| e.id.as_str()).unwrap_or(""),
                last_id = %entries.last().map(|e| e.id.as_str()).unwrap_or(""),
                "Dispatching batch"
            );

            let submitted = tokio::select! {
                biased;
                _ = self.token.cancelled() => return PollState::Stopped,
                result = self.ctx.pool.submit(move || {
                    deliver_batch(&topic, &listeners, &messages);
                }) => result,
            };
            if let Err(e) = submitted {
                error!(error = %e, "Dispatch pool unavailable, stopping");
                self.ctx.stop(&self.subscriber_id, &self.token).await;
                return PollState::Stopped;
            }
        }

        PollState::Reconciling
    }

    async fn reconcile(&mut self) -> PollState {
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return PollState::Stopped,
            result = self.ctx.store.reconcile(&self.ctx.keys, &self.subscriber_id, epoch_millis()) => result,
        };

        match result {
            Ok(alive) => {
                metrics::record_reconcile(&self.ctx.name, alive, start.elapsed());
                if !alive {
                    self.ctx.release(&self.subscriber_id, &self.token).await;
                    PollState::Stopped
                } else if self.ctx.registry.is_empty()
                    && self.ctx.stop_if_idle(&self.subscriber_id, &self.token).await
                {
                    debug!("No listeners left after reconcile, stopping");
                    PollState::Stopped
                } else {
                    PollState::Polling
                }
            }
            Err(e) => {
                error!(error = %e, "Reconciliation failed, retrying after backoff");
                metrics::record_poll_error(&self.ctx.name);
                PollState::Backoff
            }
        }
    }

    async fn backoff(&mut self) -> PollState {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => PollState::Stopped,
            _ = tokio::time::sleep(self.ctx.settings.poll_retry_delay) => PollState::Polling,
        }
    }

    async fn on_poll_error(&mut self, e: TopicError) -> PollState {
        match e {
            TopicError::LeaseLost { .. } => {
                self.ctx.release(&self.subscriber_id, &self.token).await;
                PollState::Stopped
            }
            TopicError::Shutdown => PollState::Stopped,
            e => {
                error!(
                    error = %e,
                    retry_ms = self.ctx.settings.poll_retry_delay.as_millis() as u64,
                    "Poll failed, retrying after backoff"
                );
                metrics::record_poll_error(&self.ctx.name);
                PollState::Backoff
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_context;
    use super::*;
    use crate::listener::ListenerKind;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreOp;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Note(String);

    impl Payload for Note {
        type Kind = ();
        fn kind(&self) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_loop_delivers_and_reconciles() {
        let store = MemoryStore::new();
        let ctx = test_context::<Note>("notes", &store, "10s");
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.registry.add(ListenerKind::Any, move |_: &str, n: &Note| {
            let _ = tx.send(n.clone());
        });
        store.create_subscriber(&ctx.keys, "sub", u64::MAX).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), "sub".to_string(), token.clone()));

        for text in ["a", "b"] {
            let bytes = ctx.codec.encode(&Note(text.to_string())).unwrap();
            store.publish(&ctx.keys, bytes).await.unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(Note("a".into())));
        assert_eq!(second, Some(Note("b".into())));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_loop_skips_undecodable_entries() {
        let store = MemoryStore::new();
        let ctx = test_context::<Note>("notes", &store, "10s");
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.registry.add(ListenerKind::Any, move |_: &str, n: &Note| {
            let _ = tx.send(n.clone());
        });
        store.create_subscriber(&ctx.keys, "sub", u64::MAX).await.unwrap();
        store.publish(&ctx.keys, b"not json".to_vec()).await.unwrap();
        let bytes = ctx.codec.encode(&Note("ok".to_string())).unwrap();
        store.publish(&ctx.keys, bytes).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), "sub".to_string(), token.clone()));

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got, Some(Note("ok".into())));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_loop_stops_when_group_missing() {
        let store = MemoryStore::new();
        let ctx = test_context::<Note>("notes", &store, "10s");
        ctx.registry.add(ListenerKind::Any, |_: &str, _: &Note| {});

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), "never-created".to_string(), token));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("missing group should stop the loop")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_loop_retries_after_transport_error() {
        let store = MemoryStore::new();
        let ctx = test_context::<Note>("notes", &store, "10s");
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.registry.add(ListenerKind::Any, move |_: &str, n: &Note| {
            let _ = tx.send(n.clone());
        });
        store.create_subscriber(&ctx.keys, "sub", u64::MAX).await.unwrap();
        store.fail_operation(StoreOp::OpenReader);

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), "sub".to_string(), token.clone()));

        let bytes = ctx.codec.encode(&Note("eventually".to_string())).unwrap();
        store.publish(&ctx.keys, bytes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());

        store.restore_operation(StoreOp::OpenReader);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got, Some(Note("eventually".into())));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_loop_stops_when_lease_reaped() {
        let store = MemoryStore::new();
        let ctx = test_context::<Note>("notes", &store, "10s");
        ctx.registry.add(ListenerKind::Any, |_: &str, _: &Note| {});
        // Deadline already in the past: the first reconcile reaps it
        store.create_subscriber(&ctx.keys, "sub", 1).await.unwrap();
        let bytes = ctx.codec.encode(&Note("x".to_string())).unwrap();
        store.publish(&ctx.keys, bytes).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&ctx), "sub".to_string(), token));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reaped lease should stop the loop")
            .unwrap();
        assert_eq!(store.count_groups(&ctx.keys).await.unwrap(), 0);
    }
}
