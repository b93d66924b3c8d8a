// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing store contract.
//!
//! A topic needs four things from its store:
//!
//! 1. An append-only log whose entries carry time-ordered ids ([`StreamId`])
//! 2. Consumer groups over that log, each with its own cursor
//! 3. A sorted expiry index (member = subscriber id, score = lease deadline)
//! 4. A way to run a short sequence of reads/writes as one atomic unit
//!
//! [`TopicStore`] exposes only the grouped operations the topic needs.
//! Every multi-step mutation (create group + add lease, destroy group +
//! remove lease, expire sweep + trim) is a single method, so callers can
//! never interleave half of one with another process's work.
//!
//! # Implementations
//!
//! - [`redis::RedisStore`]: Redis Streams, one Lua script per operation
//! - [`memory::MemoryStore`]: in-process, for tests and single-node embedding

pub mod memory;
pub mod redis;

use crate::error::Result;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed store futures (keeps trait signatures readable).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The two keys a topic owns.
///
/// The expiry index name is hash-tagged with the log name so both keys land
/// in the same cluster slot and can be touched by one script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKeys {
    /// Log (stream) key: the topic name.
    pub log: String,
    /// Expiry index (sorted set) key.
    pub timeout: String,
}

impl TopicKeys {
    /// Derive the keys for a topic name.
    pub fn new(name: &str) -> Self {
        Self {
            log: name.to_string(),
            timeout: suffix_name(name, "timeout"),
        }
    }
}

fn suffix_name(name: &str, suffix: &str) -> String {
    if name.contains('{') {
        format!("{}:{}", name, suffix)
    } else {
        format!("{{{}}}:{}", name, suffix)
    }
}

/// Store operations, named for logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Publish,
    CreateSubscriber,
    RemoveSubscriber,
    RenewLease,
    Reconcile,
    OpenReader,
    ReadGroup,
    Size,
    CountGroups,
    Delete,
    Expire,
    ClearExpire,
    SizeInMemory,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Publish => "PUBLISH",
            StoreOp::CreateSubscriber => "CREATE_SUBSCRIBER",
            StoreOp::RemoveSubscriber => "REMOVE_SUBSCRIBER",
            StoreOp::RenewLease => "RENEW_LEASE",
            StoreOp::Reconcile => "RECONCILE",
            StoreOp::OpenReader => "OPEN_READER",
            StoreOp::ReadGroup => "XREADGROUP",
            StoreOp::Size => "XLEN",
            StoreOp::CountGroups => "XINFO GROUPS",
            StoreOp::Delete => "DEL",
            StoreOp::Expire => "PEXPIRE",
            StoreOp::ClearExpire => "PERSIST",
            StoreOp::SizeInMemory => "MEMORY USAGE",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log entry id: `{millis}-{seq}`.
///
/// Ordered by millis, then sequence. `0` (or `0-0`) means "beginning of log".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    /// The "beginning of log" marker.
    pub const ZERO: StreamId = StreamId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Parse `"{millis}-{seq}"` or a bare `"{millis}"`.
    ///
    /// Returns `None` for malformed ids.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('-') {
            Some((millis, seq)) => Some(Self {
                millis: millis.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(Self {
                millis: s.parse().ok()?,
                seq: 0,
            }),
        }
    }

    /// The trim boundary for a cursor: the first id in the same millisecond.
    pub fn millis_floor(&self) -> Self {
        Self {
            millis: self.millis,
            seq: 0,
        }
    }

    /// The id that follows this one when appending within the same millisecond.
    pub fn next_after(&self, now_ms: u64) -> Self {
        if now_ms > self.millis {
            Self::new(now_ms, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// One raw entry read from a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id as reported by the store.
    pub id: String,
    /// Encoded payload (the `m` field).
    pub payload: Vec<u8>,
}

/// A blocking reader bound to one consumer group.
///
/// Owns whatever connection the blocking read needs, so dropping the
/// reader (or the pending read future) abandons the read.
pub trait GroupReader: Send + 'static {
    /// Block until at least one new entry is delivered to the group.
    ///
    /// Fails with [`TopicError::LeaseLost`](crate::TopicError::LeaseLost) if
    /// the group no longer exists.
    fn read(&mut self, count: Option<usize>) -> StoreFuture<'_, Vec<StreamEntry>>;
}

/// Atomic operations a reliable topic performs against its backing store.
pub trait TopicStore: Send + Sync + 'static {
    /// Reader type returned by [`open_reader`](Self::open_reader).
    type Reader: GroupReader;

    /// Append a payload and return how many consumer groups will see it.
    fn publish(&self, keys: &TopicKeys, payload: Vec<u8>) -> StoreFuture<'_, u64>;

    /// Create the subscriber's consumer group (at the beginning of the log)
    /// and its lease entry as one unit.
    fn create_subscriber(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, ()>;

    /// Destroy the subscriber's consumer group and remove its lease entry as one unit.
    fn remove_subscriber(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, ()>;

    /// Extend the lease if it still exists.
    ///
    /// Returns `false` (and changes nothing) when the lease entry is gone.
    fn renew_lease(
        &self,
        keys: &TopicKeys,
        subscriber_id: &str,
        lease_deadline_ms: u64,
    ) -> StoreFuture<'_, bool>;

    /// Reap expired subscribers, then trim the log to the slowest live group.
    ///
    /// Returns whether `subscriber_id`'s own lease still exists.
    fn reconcile(&self, keys: &TopicKeys, subscriber_id: &str, now_ms: u64) -> StoreFuture<'_, bool>;

    /// Open a blocking reader for the subscriber's consumer group.
    fn open_reader(&self, keys: &TopicKeys, subscriber_id: &str) -> StoreFuture<'_, Self::Reader>;

    /// Number of entries currently in the log.
    fn size(&self, keys: &TopicKeys) -> StoreFuture<'_, u64>;

    /// Number of consumer groups (subscribers, across all processes).
    fn count_groups(&self, keys: &TopicKeys) -> StoreFuture<'_, u64>;

    /// Delete both keys. Returns `true` if anything was deleted.
    fn delete(&self, keys: &TopicKeys) -> StoreFuture<'_, bool>;

    /// Set a time-to-live on both keys.
    fn expire(&self, keys: &TopicKeys, ttl: Duration) -> StoreFuture<'_, bool>;

    /// Expire both keys at an absolute epoch-millis instant.
    fn expire_at(&self, keys: &TopicKeys, at_ms: u64) -> StoreFuture<'_, bool>;

    /// Remove any time-to-live from both keys.
    fn clear_expire(&self, keys: &TopicKeys) -> StoreFuture<'_, bool>;

    /// Approximate bytes used by both keys.
    fn size_in_memory(&self, keys: &TopicKeys) -> StoreFuture<'_, u64>;
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
