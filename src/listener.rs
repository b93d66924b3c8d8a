// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Listener registry and type-matched dispatch.
//!
//! A topic may carry several payload variants. Each payload type implements
//! [`Payload`] to expose a cheap, copyable kind tag; listeners declare the
//! kind they want ([`ListenerKind::Only`]) or take everything
//! ([`ListenerKind::Any`]). The match is evaluated at dispatch time, and a
//! mismatch is silently skipped.
//!
//! ```rust
//! use reliable_topic::listener::{ListenerKind, ListenerRegistry, Payload};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum EventKind { Created, Deleted }
//!
//! struct Event(EventKind);
//!
//! impl Payload for Event {
//!     type Kind = EventKind;
//!     fn kind(&self) -> EventKind { self.0 }
//! }
//!
//! let registry: ListenerRegistry<Event> = ListenerRegistry::new();
//! let id = registry.add(EventKind::Created.into(), |_topic: &str, _e: &Event| {});
//! assert_eq!(registry.len(), 1);
//! assert!(registry.remove(&[id]));
//! ```

use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// A message type that can be published on a topic.
pub trait Payload: Send + Sync + 'static {
    /// Discriminant used for listener matching.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Which payloads a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind<K> {
    /// Every payload on the topic.
    Any,
    /// Only payloads of this kind.
    Only(K),
}

impl<K: PartialEq> ListenerKind<K> {
    pub fn matches(&self, kind: &K) -> bool {
        match self {
            ListenerKind::Any => true,
            ListenerKind::Only(k) => k == kind,
        }
    }
}

impl<K> From<K> for ListenerKind<K> {
    fn from(kind: K) -> Self {
        ListenerKind::Only(kind)
    }
}

/// Callback invoked for each matching message.
///
/// Runs on the dispatch pool, never on the I/O task. Implemented for any
/// `Fn(&str, &M)` closure; the first argument is the topic name.
pub trait MessageListener<M>: Send + Sync + 'static {
    fn on_message(&self, topic: &str, message: &M);
}

impl<M, F> MessageListener<M> for F
where
    F: Fn(&str, &M) + Send + Sync + 'static,
{
    fn on_message(&self, topic: &str, message: &M) {
        self(topic, message)
    }
}

/// A registered listener.
pub struct ListenerEntry<M: Payload> {
    pub id: String,
    pub kind: ListenerKind<M::Kind>,
    listener: Arc<dyn MessageListener<M>>,
    /// Registration order, used to keep snapshots stable.
    seq: u64,
}

impl<M: Payload> Clone for ListenerEntry<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            listener: Arc::clone(&self.listener),
            seq: self.seq,
        }
    }
}

impl<M: Payload> ListenerEntry<M> {
    /// Invoke the listener if the message matches its declared kind.
    ///
    /// Returns `true` if the callback ran to completion. A panicking
    /// callback is caught and logged so it cannot take down the pool or
    /// starve the remaining listeners.
    pub fn deliver(&self, topic: &str, message: &M) -> bool {
        if !self.kind.matches(&message.kind()) {
            return false;
        }
        let listener = &self.listener;
        match catch_unwind(AssertUnwindSafe(|| listener.on_message(topic, message))) {
            Ok(()) => true,
            Err(_) => {
                error!(topic = %topic, listener_id = %self.id, "Listener panicked");
                crate::metrics::record_listener_panic(topic);
                false
            }
        }
    }
}

/// Local table of listeners for one topic.
pub struct ListenerRegistry<M: Payload> {
    entries: DashMap<String, ListenerEntry<M>>,
    next_seq: AtomicU64,
}

impl<M: Payload> Default for ListenerRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Payload> ListenerRegistry<M> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Store a listener under a fresh id and return the id.
    pub fn add<L>(&self, kind: ListenerKind<M::Kind>, listener: L) -> String
    where
        L: MessageListener<M>,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = ListenerEntry {
            id: id.clone(),
            kind,
            listener: Arc::new(listener),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(id.clone(), entry);
        trace!(listener_id = %id, ?kind, "Listener added");
        id
    }

    /// Remove listeners by id. Unknown ids are ignored.
    ///
    /// Returns `true` if this call left the registry empty after removing
    /// at least one entry.
    pub fn remove<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        let removed = ids
            .iter()
            .filter(|id| self.entries.remove(id.as_ref()).is_some())
            .count();
        removed > 0 && self.entries.is_empty()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of the listeners, in registration order.
    pub fn snapshot(&self) -> Vec<ListenerEntry<M>> {
        let mut entries: Vec<ListenerEntry<M>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Order,
        Text,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Msg {
        Order(u64),
        Text(String),
    }

    impl Payload for Msg {
        type Kind = Kind;
        fn kind(&self) -> Kind {
            match self {
                Msg::Order(_) => Kind::Order,
                Msg::Text(_) => Kind::Text,
            }
        }
    }

    #[test]
    fn test_listener_kind_matches() {
        assert!(ListenerKind::Any.matches(&Kind::Order));
        assert!(ListenerKind::Only(Kind::Order).matches(&Kind::Order));
        assert!(!ListenerKind::Only(Kind::Order).matches(&Kind::Text));
        assert_eq!(ListenerKind::from(Kind::Text), ListenerKind::Only(Kind::Text));
    }

    #[test]
    fn test_add_and_remove() {
        let registry: ListenerRegistry<Msg> = ListenerRegistry::new();
        let a = registry.add(ListenerKind::Any, |_: &str, _: &Msg| {});
        let b = registry.add(Kind::Order.into(), |_: &str, _: &Msg| {});
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        // Unknown ids are ignored and do not count as emptying
        assert!(!registry.remove(&["missing"]));
        assert!(!registry.remove(&[a.as_str()]));
        assert_eq!(registry.snapshot().iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec![b.clone()]);
        assert!(registry.remove(&[b]));
        assert!(registry.is_empty());

        // Already empty: nothing removed, nothing to tear down
        assert!(!registry.remove(&["missing"]));
    }

    #[test]
    fn test_snapshot_in_registration_order() {
        let registry: ListenerRegistry<Msg> = ListenerRegistry::new();
        let ids: Vec<String> = (0..10)
            .map(|_| registry.add(ListenerKind::Any, |_: &str, _: &Msg| {}))
            .collect();
        let snapshot: Vec<String> = registry.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(snapshot, ids);
    }

    #[test]
    fn test_deliver_type_match() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry: ListenerRegistry<Msg> = ListenerRegistry::new();
        registry.add(Kind::Order.into(), move |topic: &str, m: &Msg| {
            sink.lock().unwrap().push((topic.to_string(), m.clone()));
        });

        let entry = registry.snapshot().remove(0);
        assert!(entry.deliver("orders", &Msg::Order(1)));
        assert!(!entry.deliver("orders", &Msg::Text("hi".into())));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("orders".to_string(), Msg::Order(1))]);
    }

    #[test]
    fn test_deliver_catches_panic() {
        let registry: ListenerRegistry<Msg> = ListenerRegistry::new();
        registry.add(ListenerKind::Any, |_: &str, _: &Msg| panic!("boom"));
        let entry = registry.snapshot().remove(0);
        assert!(!entry.deliver("orders", &Msg::Order(7)));
    }

    #[test]
    fn test_clear() {
        let registry: ListenerRegistry<Msg> = ListenerRegistry::new();
        registry.add(ListenerKind::Any, |_: &str, _: &Msg| {});
        registry.clear();
        assert!(registry.is_empty());
    }
}
