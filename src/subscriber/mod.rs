// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber lifecycle: election, background loops and teardown.
//!
//! # Lifecycle
//!
//! ```text
//!               first listener
//!   [empty] ─────────────────────► elect ──► create group + lease (atomic)
//!      ▲                                          │
//!      │                                          ├──► lease loop  (renew every timeout/3)
//!      │                                          └──► poll loop   (read → dispatch → reconcile)
//!      │
//!      ├──── teardown: last listener removed ─── cancel loops, join, remove group + lease
//!      └──── release:  lease lost ────────────── cancel loops, leave remote state to GC
//! ```
//!
//! The slot holds at most one [`ActiveSubscriber`] per topic instance. Its
//! mutex is held across the remote create during election and across the
//! loop join during teardown, so the remote group and lease only ever
//! change while the slot is locked.
//!
//! # Cancellation
//!
//! Each subscriber owns a child of the topic's root [`CancellationToken`].
//! Loops select on it around every await, so cancelling the token drops any
//! in-flight read or renewal before teardown touches shared state.
//!
//! A loop that discovers its lease is gone calls [`SubscriberContext::release`],
//! which races the slot lock against its own token. If a teardown already
//! holds the lock it has cancelled that token, so the loop exits instead of
//! deadlocking against the join.
//!
//! # Idle subscribers
//!
//! A poll loop that reads with no listeners registered stops only after
//! rechecking the registry under the slot lock, and marks its subscriber
//! stopped when it does. A stopped subscriber is never handed out again:
//! the next election or teardown retires it, so a listener registered while
//! the loop was winding down always ends up with a polling subscriber.

pub(crate) mod lease;
pub(crate) mod poll;

use crate::codec::Codec;
use crate::config::TopicConfig;
use crate::dispatch::DispatchPool;
use crate::error::{Result, TopicError};
use crate::listener::{ListenerRegistry, Payload};
use crate::metrics;
use crate::store::{epoch_millis, TopicKeys, TopicStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Loop timings resolved once from [`TopicConfig`].
#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub watchdog_timeout: Duration,
    pub renewal_period: Duration,
    pub poll_retry_delay: Duration,
    pub read_count: Option<usize>,
}

impl LoopSettings {
    pub fn from_config(config: &TopicConfig) -> Self {
        Self {
            watchdog_timeout: config.watchdog_timeout_duration(),
            renewal_period: config.renewal_period(),
            poll_retry_delay: config.poll_retry_delay_duration(),
            read_count: config.read_count,
        }
    }

    /// Lease deadline for a renewal issued now.
    pub fn lease_deadline(&self) -> u64 {
        epoch_millis().saturating_add(self.watchdog_timeout.as_millis() as u64)
    }
}

/// The elected subscriber and the handles of its loops.
struct ActiveSubscriber {
    id: String,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    /// Set once the poll loop has given up; the subscriber must be retired.
    stopped: bool,
}

/// Single-occupant holder for the local subscriber identity.
#[derive(Default)]
pub(crate) struct SubscriberSlot {
    current: Mutex<Option<ActiveSubscriber>>,
}

/// Everything the loops and the facade share for one topic instance.
pub(crate) struct SubscriberContext<M: Payload, S: TopicStore> {
    pub name: String,
    pub keys: TopicKeys,
    pub store: Arc<S>,
    pub registry: ListenerRegistry<M>,
    pub codec: Arc<dyn Codec<M>>,
    pub pool: DispatchPool,
    pub settings: LoopSettings,
    pub slot: SubscriberSlot,
    /// Parent of every subscriber token; cancelled when the topic is dropped.
    pub root: CancellationToken,
}

impl<M: Payload, S: TopicStore> SubscriberContext<M, S> {
    /// Id of the current subscriber, if one is elected.
    pub async fn subscriber_id(&self) -> Option<String> {
        self.slot.current.lock().await.as_ref().map(|a| a.id.clone())
    }

    /// Elect a subscriber unless one already exists.
    ///
    /// Returns the subscriber id (existing or new), or `None` if every
    /// listener was removed before the slot was acquired.
    pub async fn elect(self: &Arc<Self>) -> Result<Option<String>> {
        let mut current = self.slot.current.lock().await;
        match current.take() {
            Some(active) if !active.stopped => {
                let id = active.id.clone();
                *current = Some(active);
                return Ok(Some(id));
            }
            Some(stale) => {
                // Failure is logged by retire; the stale lease lapses on its own
                let _ = self.retire(stale, "stopped").await;
            }
            None => {}
        }
        if self.root.is_cancelled() {
            return Err(TopicError::Shutdown);
        }
        if self.registry.is_empty() {
            debug!(topic = %self.name, "No listeners left, skipping election");
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let deadline = self.settings.lease_deadline();
        self.store
            .create_subscriber(&self.keys, &id, deadline)
            .await?;

        let token = self.root.child_token();
        let lease_span = info_span!("lease", topic = %self.name, subscriber_id = %id);
        let poll_span = info_span!("poll", topic = %self.name, subscriber_id = %id);
        let tasks = vec![
            tokio::spawn(
                lease::run(Arc::clone(self), id.clone(), token.clone()).instrument(lease_span),
            ),
            tokio::spawn(
                poll::run(Arc::clone(self), id.clone(), token.clone()).instrument(poll_span),
            ),
        ];

        *current = Some(ActiveSubscriber {
            id: id.clone(),
            token,
            tasks,
            stopped: false,
        });

        metrics::record_subscriber_elected(&self.name);
        info!(topic = %self.name, subscriber_id = %id, "Subscriber elected");
        Ok(Some(id))
    }

    /// Stop the loops and remove the subscriber's group and lease.
    ///
    /// Keeps a running subscriber if listeners were added again before the
    /// slot was acquired. A stopped subscriber is always retired, and a fresh
    /// one elected if listeners remain. The slot is cleared even when the
    /// remote removal fails; the lease then lapses and a peer reaps it.
    pub async fn teardown(self: &Arc<Self>, reason: &'static str) -> Result<()> {
        let mut current = self.slot.current.lock().await;
        let running = current.as_ref().is_some_and(|a| !a.stopped);
        if running && !self.registry.is_empty() {
            debug!(topic = %self.name, "Listeners re-registered, keeping subscriber");
            return Ok(());
        }
        let Some(active) = current.take() else {
            return Ok(());
        };
        let reason = if active.stopped { "stopped" } else { reason };
        let result = self.retire(active, reason).await;
        drop(current);

        if !self.registry.is_empty() {
            self.elect().await?;
        }
        result
    }

    /// Cancel and join a subscriber's loops, then remove it remotely.
    async fn retire(&self, active: ActiveSubscriber, reason: &'static str) -> Result<()> {
        active.token.cancel();
        for task in active.tasks {
            if let Err(e) = task.await {
                error!(topic = %self.name, subscriber_id = %active.id, error = %e, "Subscriber task failed");
            }
        }

        let result = self.store.remove_subscriber(&self.keys, &active.id).await;
        match &result {
            Ok(()) => {
                metrics::record_subscriber_removed(&self.name, reason);
                info!(topic = %self.name, subscriber_id = %active.id, reason, "Subscriber removed");
            }
            Err(e) => {
                warn!(
                    topic = %self.name,
                    subscriber_id = %active.id,
                    error = %e,
                    "Failed to remove subscriber, lease will lapse"
                );
            }
        }
        result
    }

    /// Give up the slot after the subscriber's lease was found missing.
    ///
    /// Called from inside a loop. Cancels the sibling loop but does not join
    /// it, and leaves remote state alone: the lease is already gone and a
    /// leftover group is reaped by the next reconciliation.
    pub async fn release(&self, subscriber_id: &str, token: &CancellationToken) {
        let Some(mut current) = self.lock_slot(token).await else {
            return;
        };

        if current.as_ref().is_some_and(|a| a.id == subscriber_id) {
            if let Some(active) = current.take() {
                active.token.cancel();
                metrics::record_subscriber_removed(&self.name, "lease_lost");
                warn!(topic = %self.name, subscriber_id, "Lease lost, subscriber released");
            }
        }
    }

    /// Called by a poll loop that found no listeners after a read.
    ///
    /// Returns `true` if the loop should stop, in which case the subscriber
    /// is marked stopped. Returns `false` if listeners were registered
    /// again in the meantime.
    pub async fn stop_if_idle(&self, subscriber_id: &str, token: &CancellationToken) -> bool {
        let Some(mut current) = self.lock_slot(token).await else {
            return true;
        };
        if !self.registry.is_empty() {
            return false;
        }
        mark_stopped(&mut current, subscriber_id);
        true
    }

    /// Mark the subscriber stopped after its poll loop failed for good.
    pub async fn stop(&self, subscriber_id: &str, token: &CancellationToken) {
        if let Some(mut current) = self.lock_slot(token).await {
            mark_stopped(&mut current, subscriber_id);
        }
    }

    /// Lock the slot unless `token` is cancelled first.
    async fn lock_slot(&self, token: &CancellationToken) -> Option<MutexGuard<'_, Option<ActiveSubscriber>>> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            guard = self.slot.current.lock() => Some(guard),
        }
    }
}

/// Flag the subscriber and cancel its lease loop so the lease is not renewed.
fn mark_stopped(current: &mut Option<ActiveSubscriber>, subscriber_id: &str) {
    if let Some(active) = current.as_mut().filter(|a| a.id == subscriber_id) {
        active.stopped = true;
        active.token.cancel();
        debug!(subscriber_id, "Poll loop stopped, subscriber awaiting retirement");
    }
}

/// Context over a [`MemoryStore`](crate::store::memory::MemoryStore) for loop tests.
#[cfg(test)]
pub(crate) fn test_context<M>(
    name: &str,
    store: &crate::store::memory::MemoryStore,
    watchdog_timeout: &str,
) -> Arc<SubscriberContext<M, crate::store::memory::MemoryStore>>
where
    M: Payload + serde::Serialize + serde::de::DeserializeOwned,
{
    let config = TopicConfig::for_testing(watchdog_timeout);
    Arc::new(SubscriberContext {
        name: name.to_string(),
        keys: TopicKeys::new(name),
        store: Arc::new(store.clone()),
        registry: ListenerRegistry::new(),
        codec: Arc::new(crate::codec::JsonCodec),
        pool: DispatchPool::new(&config.dispatch),
        settings: LoopSettings::from_config(&config),
        slot: SubscriberSlot::default(),
        root: CancellationToken::new(),
    })
}
