// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process topic store.
//!
//! Implements the same atomic operations as [`RedisStore`](super::redis::RedisStore)
//! behind one async mutex, so every grouped operation is trivially atomic.
//! Clones share state, which lets several [`ReliableTopic`](crate::ReliableTopic)
//! instances stand in for separate processes talking to one server.
//!
//! # Fault Injection
//!
//! Tests can make individual operations fail ([`MemoryStore::fail_operation`])
//! or take the whole store offline ([`MemoryStore::set_offline`]). Injected
//! failures surface as [`TopicError::Redis`], the same transient error a
//! dropped connection would produce.
//!
//! Both keys of a topic share one expiry here; Redis keeps one per key but
//! every passthrough sets them together anyway.

use super::{
    epoch_millis, GroupReader, StoreFuture, StoreOp, StreamEntry, StreamId, TopicKeys, TopicStore,
};
use crate::error::{Result, TopicError};
use dashmap::DashSet;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Rough per-entry overhead used by [`TopicStore::size_in_memory`].
const ENTRY_OVERHEAD_BYTES: u64 = 16;

#[derive(Debug, Default)]
struct TopicState {
    entries: BTreeMap<StreamId, Vec<u8>>,
    /// Consumer group name → last delivered id.
    groups: HashMap<String, StreamId>,
    /// Subscriber id → lease deadline (epoch millis).
    leases: HashMap<String, u64>,
    last_id: StreamId,
    expires_at: Option<u64>,
}

impl TopicState {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    /// Wakes blocked readers on any change that could affect them.
    changed: Notify,
    failing: DashSet<StoreOp>,
    offline: AtomicBool,
}

impl Inner {
    fn check(&self, op: StoreOp) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(TopicError::redis_msg(op.as_str(), "store offline"));
        }
        if self.failing.contains(&op) {
            return Err(TopicError::redis_msg(op.as_str(), "injected failure"));
        }
        Ok(())
    }
}

/// Look up a topic, dropping it first if its expiry has passed.
fn live_topic<'a>(
    topics: &'a mut HashMap<String, TopicState>,
    key: &str,
    now_ms: u64,
) -> Option<&'a mut TopicState> {
    if topics.get(key).is_some_and(|t| t.is_expired(now_ms)) {
        topics.remove(key);
    }
    topics.get_mut(key)
}

/// Shared in-memory store. Cheap to clone.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                failing: DashSet::new(),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Make every call of `op` fail until restored.
    pub fn fail_operation(&self, op: StoreOp) {
        self.inner.failing.insert(op);
        self.inner.changed.notify_waiters();
    }

    /// Undo [`fail_operation`](Self::fail_operation).
    pub fn restore_operation(&self, op: StoreOp) {
        self.inner.failing.remove(&op);
    }

    /// Fail every operation (including blocked reads) while offline.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Release);
        self.inner.changed.notify_waiters();
    }

    /// Lease deadline currently recorded for a subscriber.
    pub async fn lease_deadline(&self, keys: &TopicKeys, subscriber_id: &str) -> Option<u64> {
        let mut topics = self.inner.topics.lock().await;
        live_topic(&mut topics, &keys.log, epoch_millis())
            .and_then(|t| t.leases.get(subscriber_id).copied())
    }

    /// Cursor of a subscriber's consumer group.
    pub async fn group_cursor(&self, keys: &TopicKeys, subscriber_id: &str) -> Option<StreamId> {
        let mut topics = self.inner.topics.lock().await;
        live_topic(&mut topics, &keys.log, epoch_millis())
            .and_then(|t| t.groups.get(subscriber_id).copied())
    }

    /// Remaining time-to-live of a topic, if one is set.
    pub async fn ttl(&self, keys: &TopicKeys) -> Option<Duration> {
        let now = epoch_millis();
        let mut topics = self.inner.topics.lock().await;
        live_topic(&mut topics, &keys.log, now)
            .and_then(|t| t.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    fn set_expiry(&self, keys: &TopicKeys, op: StoreOp, at: Option<u64>) -> StoreFuture<'_, bool> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(op)?;
            let mut topics = self.inner.topics.lock().await;
            let now = epoch_millis();
            let Some(topic) = live_topic(&mut topics, &log, now) else {
                return Ok(false);
            };
            let had_expiry = topic.expires_at.is_some();
            topic.expires_at = at;
            if at.is_some_and(|at| at <= now) {
                topics.remove(&log);
                self.inner.changed.notify_waiters();
            }
            // PERSIST reports whether a timeout was removed
            Ok(at.is_some() || had_expiry)
        })
    }
}

impl TopicStore for MemoryStore {
    type Reader = MemoryGroupReader;

    fn publish(&self, keys: &TopicKeys, payload: Vec<u8>) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(StoreOp::Publish)?;
            let now = epoch_millis();
            let mut topics = self.inner.topics.lock().await;
            if live_topic(&mut topics, &log, now).is_none() {
                topics.insert(log.clone(), TopicState::default());
            }
            let topic = topics
                .get_mut(&log)
                .ok_or_else(|| TopicError::Internal(format!("topic {} vanished", log)))?;
            let id = topic.last_id.next_after(now);
            topic.last_id = id;
            topic.entries.insert(id, payload);
            let groups = topic.groups.len() as u64;
            drop(topics);
            self.inner.changed.notify_waiters();
            Ok(groups)
        })
    }

    fn create_subscriber(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, ()> {
        let log = keys.log.clone();
        let id = subscriber_id.to_string();
        Box::pin(async move {
            self.inner.check(StoreOp::CreateSubscriber)?;
            let mut topics = self.inner.topics.lock().await;
            if live_topic(&mut topics, &log, epoch_millis()).is_none() {
                topics.insert(log.clone(), TopicState::default());
            }
            let topic = topics
                .get_mut(&log)
                .ok_or_else(|| TopicError::Internal(format!("topic {} vanished", log)))?;
            if topic.groups.contains_key(&id) {
                return Err(TopicError::redis_msg(
                    StoreOp::CreateSubscriber.as_str(),
                    "BUSYGROUP Consumer Group name already exists",
                ));
            }
            topic.groups.insert(id.clone(), StreamId::ZERO);
            topic.leases.insert(id, lease_deadline_ms);
            Ok(())
        })
    }

    fn remove_subscriber(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, ()> {
        let log = keys.log.clone();
        let id = subscriber_id.to_string();
        Box::pin(async move {
            self.inner.check(StoreOp::RemoveSubscriber)?;
            let mut topics = self.inner.topics.lock().await;
            if let Some(topic) = live_topic(&mut topics, &log, epoch_millis()) {
                topic.groups.remove(&id);
                topic.leases.remove(&id);
            }
            drop(topics);
            self.inner.changed.notify_waiters();
            Ok(())
        })
    }

    fn renew_lease(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, bool> {
        let log = keys.log.clone();
        let id = subscriber_id.to_string();
        Box::pin(async move {
            self.inner.check(StoreOp::RenewLease)?;
            let mut topics = self.inner.topics.lock().await;
            let Some(lease) = live_topic(&mut topics, &log, epoch_millis())
                .and_then(|t| t.leases.get_mut(&id))
            else {
                return Ok(false);
            };
            *lease = lease_deadline_ms;
            Ok(true)
        })
    }

    fn reconcile(&self, keys: &TopicKeys, subscriber_id: &str, now_ms: u64) -> StoreFuture<'_, bool> {
        let log = keys.log.clone();
        let id = subscriber_id.to_string();
        Box::pin(async move {
            self.inner.check(StoreOp::Reconcile)?;
            let mut topics = self.inner.topics.lock().await;
            let Some(topic) = live_topic(&mut topics, &log, epoch_millis()) else {
                return Ok(false);
            };

            let expired: Vec<String> = topic
                .leases
                .iter()
                .filter(|(_, deadline)| **deadline < now_ms)
                .map(|(sub, _)| sub.clone())
                .collect();
            for sub in &expired {
                topic.groups.remove(sub);
                topic.leases.remove(sub);
            }
            let alive = topic.leases.contains_key(&id);

            match topic.groups.values().min().copied() {
                None => topic.entries.clear(),
                Some(slowest) => {
                    let bound = slowest.millis_floor();
                    topic.entries = topic.entries.split_off(&bound);
                    if topic.entries.len() == 1 && topic.entries.contains_key(&bound) {
                        topic.entries.clear();
                    }
                }
            }

            drop(topics);
            if !expired.is_empty() {
                self.inner.changed.notify_waiters();
            }
            Ok(alive)
        })
    }

    fn open_reader(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, Self::Reader> {
        let keys = keys.clone();
        let group = subscriber_id.to_string();
        Box::pin(async move {
            self.inner.check(StoreOp::OpenReader)?;
            Ok(MemoryGroupReader {
                inner: Arc::clone(&self.inner),
                keys,
                group,
            })
        })
    }

    fn size(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(StoreOp::Size)?;
            let mut topics = self.inner.topics.lock().await;
            Ok(live_topic(&mut topics, &log, epoch_millis())
                .map(|t| t.entries.len() as u64)
                .unwrap_or(0))
        })
    }

    fn count_groups(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(StoreOp::CountGroups)?;
            let mut topics = self.inner.topics.lock().await;
            Ok(live_topic(&mut topics, &log, epoch_millis())
                .map(|t| t.groups.len() as u64)
                .unwrap_or(0))
        })
    }

    fn delete(&self, keys: &TopicKeys) -> StoreFuture<'_, bool> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(StoreOp::Delete)?;
            let mut topics = self.inner.topics.lock().await;
            let existed = live_topic(&mut topics, &log, epoch_millis()).is_some();
            topics.remove(&log);
            drop(topics);
            self.inner.changed.notify_waiters();
            Ok(existed)
        })
    }

    fn expire(&self, keys: &TopicKeys, ttl: Duration) -> StoreFuture<'_, bool> {
        let at = epoch_millis().saturating_add(ttl.as_millis() as u64);
        self.set_expiry(keys, StoreOp::Expire, Some(at))
    }

    fn expire_at(&self, keys: &TopicKeys, at_ms: u64) -> StoreFuture<'_, bool> {
        self.set_expiry(keys, StoreOp::Expire, Some(at_ms))
    }

    fn clear_expire(&self, keys: &TopicKeys) -> StoreFuture<'_, bool> {
        self.set_expiry(keys, StoreOp::ClearExpire, None)
    }

    fn size_in_memory(&self, keys: &TopicKeys) -> StoreFuture<'_, u64> {
        let log = keys.log.clone();
        Box::pin(async move {
            self.inner.check(StoreOp::SizeInMemory)?;
            let mut topics = self.inner.topics.lock().await;
            let Some(topic) = live_topic(&mut topics, &log, epoch_millis()) else {
                return Ok(0);
            };
            let entries: u64 = topic
                .entries
                .values()
                .map(|p| p.len() as u64 + ENTRY_OVERHEAD_BYTES)
                .sum();
            let names: u64 = topic
                .groups
                .keys()
                .chain(topic.leases.keys())
                .map(|k| k.len() as u64 + ENTRY_OVERHEAD_BYTES)
                .sum();
            Ok(entries + names)
        })
    }
}

/// Blocking reader over one in-memory consumer group.
pub struct MemoryGroupReader {
    inner: Arc<Inner>,
    keys: TopicKeys,
    group: String,
}

impl GroupReader for MemoryGroupReader {
    fn read(&mut self, count: Option<usize>) -> StoreFuture<'_, Vec<StreamEntry>> {
        Box::pin(async move {
            loop {
                // Register for wakeups before inspecting state so a publish
                // between the check and the await is not missed.
                let notified = self.inner.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    self.inner.check(StoreOp::ReadGroup)?;
                    let mut topics = self.inner.topics.lock().await;
                    let topic = live_topic(&mut topics, &self.keys.log, epoch_millis())
                        .ok_or_else(|| TopicError::lease_lost(&self.group))?;
                    let cursor = *topic
                        .groups
                        .get(&self.group)
                        .ok_or_else(|| TopicError::lease_lost(&self.group))?;

                    let limit = count.unwrap_or(usize::MAX);
                    let batch: Vec<(StreamId, Vec<u8>)> = topic
                        .entries
                        .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded))
                        .take(limit)
                        .map(|(id, payload)| (*id, payload.clone()))
                        .collect();

                    if let Some((last, _)) = batch.last() {
                        topic.groups.insert(self.group.clone(), *last);
                        return Ok(batch
                            .into_iter()
                            .map(|(id, payload)| StreamEntry {
                                id: id.to_string(),
                                payload,
                            })
                            .collect());
                    }
                }

                notified.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TopicKeys {
        TopicKeys::new("orders")
    }

    fn far_future() -> u64 {
        epoch_millis() + 60_000
    }

    #[tokio::test]
    async fn test_publish_counts_groups() {
        let store = MemoryStore::new();
        assert_eq!(store.publish(&keys(), b"a".to_vec()).await.unwrap(), 0);

        store.create_subscriber(&keys(), "s1", far_future()).await.unwrap();
        store.create_subscriber(&keys(), "s2", far_future()).await.unwrap();
        assert_eq!(store.publish(&keys(), b"b".to_vec()).await.unwrap(), 2);
        assert_eq!(store.size(&keys()).await.unwrap(), 2);
        assert_eq!(store.count_groups(&keys()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_group_reads_from_beginning() {
        let store = MemoryStore::new();
        store.publish(&keys(), b"early".to_vec()).await.unwrap();
        store.create_subscriber(&keys(), "s1", far_future()).await.unwrap();

        let mut reader = store.open_reader(&keys(), "s1").await.unwrap();
        let batch = reader.read(None).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"early");
    }

    #[tokio::test]
    async fn test_read_respects_count_and_advances_cursor() {
        let store = MemoryStore::new();
        store.create_subscriber(&keys(), "s1", far_future()).await.unwrap();
        for i in 0..5u8 {
            store.publish(&keys(), vec![i]).await.unwrap();
        }

        let mut reader = store.open_reader(&keys(), "s1").await.unwrap();
        let first = reader.read(Some(3)).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = reader.read(Some(3)).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].payload, vec![4]);

        let cursor = store.group_cursor(&keys(), "s1").await.unwrap();
        assert_eq!(cursor.to_string(), rest[1].id);
    }

    #[tokio::test]
    async fn test_read_blocks_until_publish() {
        let store = MemoryStore::new();
        store.create_subscriber(&keys(), "s1", far_future()).await.unwrap();
        let mut reader = store.open_reader(&keys(), "s1").await.unwrap();

        let publisher = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&keys(), b"late".to_vec()).await.unwrap();
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), reader.read(None))
            .await
            .expect("read should wake on publish")
            .unwrap();
        assert_eq!(batch[0].payload, b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_fails_with_lease_lost_when_group_removed() {
        let store = MemoryStore::new();
        store.create_subscriber(&keys(), "s1", far_future()).await.unwrap();
        let mut reader = store.open_reader(&keys(), "s1").await.unwrap();

        let remover = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remover.remove_subscriber(&keys(), "s1").await.unwrap();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), reader.read(None))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_renew_lease() {
        let store = MemoryStore::new();
        assert!(!store.renew_lease(&keys(), "s1", far_future()).await.unwrap());

        store.create_subscriber(&keys(), "s1", 1).await.unwrap();
        let deadline = far_future();
        assert!(store.renew_lease(&keys(), "s1", deadline).await.unwrap());
        assert_eq!(store.lease_deadline(&keys(), "s1").await, Some(deadline));

        store.remove_subscriber(&keys(), "s1").await.unwrap();
        assert!(!store.renew_lease(&keys(), "s1", deadline).await.unwrap());
        // A failed renewal must not recreate the lease
        assert_eq!(store.lease_deadline(&keys(), "s1").await, None);
    }

    #[tokio::test]
    async fn test_reconcile_reaps_expired_subscribers() {
        let store = MemoryStore::new();
        let now = epoch_millis();
        store.create_subscriber(&keys(), "live", now + 60_000).await.unwrap();
        store.create_subscriber(&keys(), "dead", now - 1).await.unwrap();

        assert!(store.reconcile(&keys(), "live", now).await.unwrap());
        assert_eq!(store.count_groups(&keys()).await.unwrap(), 1);
        assert_eq!(store.lease_deadline(&keys(), "dead").await, None);
        assert!(!store.reconcile(&keys(), "dead", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_trims_to_slowest_group() {
        let store = MemoryStore::new();
        store.create_subscriber(&keys(), "fast", far_future()).await.unwrap();
        store.create_subscriber(&keys(), "slow", far_future()).await.unwrap();
        for i in 0..3u8 {
            store.publish(&keys(), vec![i]).await.unwrap();
        }

        let mut fast = store.open_reader(&keys(), "fast").await.unwrap();
        assert_eq!(fast.read(None).await.unwrap().len(), 3);

        // slow has consumed nothing, so nothing may be trimmed
        store.reconcile(&keys(), "fast", epoch_millis()).await.unwrap();
        assert_eq!(store.size(&keys()).await.unwrap(), 3);

        let mut slow = store.open_reader(&keys(), "slow").await.unwrap();
        assert_eq!(slow.read(None).await.unwrap().len(), 3);
        store.reconcile(&keys(), "slow", epoch_millis()).await.unwrap();
        assert!(store.size(&keys()).await.unwrap() <= 3);

        // Once everyone has moved on, the next reconcile after more traffic clears history
        store.publish(&keys(), vec![9]).await.unwrap();
        assert_eq!(fast.read(None).await.unwrap().len(), 1);
        assert_eq!(slow.read(None).await.unwrap().len(), 1);
        store.reconcile(&keys(), "slow", epoch_millis()).await.unwrap();
        let remaining = store.size(&keys()).await.unwrap();
        assert!(remaining <= 1, "only same-millisecond leftovers may remain, got {}", remaining);
    }

    #[tokio::test]
    async fn test_reconcile_without_groups_clears_log() {
        let store = MemoryStore::new();
        store.publish(&keys(), b"orphan".to_vec()).await.unwrap();
        assert!(!store.reconcile(&keys(), "nobody", epoch_millis()).await.unwrap());
        assert_eq!(store.size(&keys()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.fail_operation(StoreOp::Publish);
        let err = store.publish(&keys(), b"x".to_vec()).await.unwrap_err();
        assert!(err.is_retryable());
        store.restore_operation(StoreOp::Publish);
        store.publish(&keys(), b"x".to_vec()).await.unwrap();

        store.set_offline(true);
        assert!(store.size(&keys()).await.is_err());
        store.set_offline(false);
        assert_eq!(store.size(&keys()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expiry_and_delete() {
        let store = MemoryStore::new();
        store.publish(&keys(), b"x".to_vec()).await.unwrap();

        assert!(store.expire(&keys(), Duration::from_secs(60)).await.unwrap());
        assert!(store.ttl(&keys()).await.is_some());
        assert!(store.clear_expire(&keys()).await.unwrap());
        assert!(store.ttl(&keys()).await.is_none());

        assert!(store.expire_at(&keys(), epoch_millis() - 1).await.unwrap());
        assert_eq!(store.size(&keys()).await.unwrap(), 0);
        assert!(!store.delete(&keys()).await.unwrap());

        store.publish(&keys(), b"y".to_vec()).await.unwrap();
        assert!(store.size_in_memory(&keys()).await.unwrap() > 0);
        assert!(store.delete(&keys()).await.unwrap());
        assert_eq!(store.size_in_memory(&keys()).await.unwrap(), 0);
    }
}
