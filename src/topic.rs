// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The [`ReliableTopic`] facade.
//!
//! Every process that creates a `ReliableTopic` with listeners becomes an
//! independent subscriber: published messages are broadcast to every live
//! subscriber, never load-balanced between them. Inside a process, one
//! subscriber fans each message out to all matching local listeners.
//!
//! # Shutdown
//!
//! Call [`remove_all_listeners`](ReliableTopic::remove_all_listeners) for a
//! clean exit: it stops the loops and removes the consumer group and lease.
//! Dropping the topic only cancels the local loops, exactly like a crash;
//! the abandoned lease is reaped by another process once it lapses.

use crate::codec::{Codec, JsonCodec};
use crate::config::TopicConfig;
use crate::dispatch::DispatchPool;
use crate::error::Result;
use crate::listener::{ListenerKind, ListenerRegistry, MessageListener, Payload};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::redis::RedisStore;
use crate::store::{TopicKeys, TopicStore};
use crate::subscriber::{LoopSettings, SubscriberContext, SubscriberSlot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A durable, at-least-once publish/subscribe topic.
pub struct ReliableTopic<M: Payload, S: TopicStore = RedisStore> {
    ctx: Arc<SubscriberContext<M, S>>,
}

impl<M> ReliableTopic<M, RedisStore>
where
    M: Payload + Serialize + DeserializeOwned,
{
    /// Connect to `config.redis_url` and open the topic with JSON encoding.
    pub async fn connect(name: impl Into<String>, config: TopicConfig) -> Result<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config.redis_url, &RetryConfig::startup()).await?;
        Self::new(name, Arc::new(store), config)
    }
}

impl<M, S> ReliableTopic<M, S>
where
    M: Payload + Serialize + DeserializeOwned,
    S: TopicStore,
{
    /// Open a topic over an existing store with JSON encoding.
    pub fn new(name: impl Into<String>, store: Arc<S>, config: TopicConfig) -> Result<Self> {
        Self::with_codec(name, store, config, Arc::new(JsonCodec))
    }
}

impl<M: Payload, S: TopicStore> ReliableTopic<M, S> {
    /// Open a topic with a custom codec.
    pub fn with_codec(
        name: impl Into<String>,
        store: Arc<S>,
        config: TopicConfig,
        codec: Arc<dyn Codec<M>>,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        debug!(topic = %name, watchdog_timeout = %config.watchdog_timeout, "Opening topic");

        Ok(Self {
            ctx: Arc::new(SubscriberContext {
                keys: TopicKeys::new(&name),
                name,
                store,
                registry: ListenerRegistry::new(),
                codec,
                pool: DispatchPool::new(&config.dispatch),
                settings: LoopSettings::from_config(&config),
                slot: SubscriberSlot::default(),
                root: CancellationToken::new(),
            }),
        })
    }

    /// Topic name (also the log key).
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Append a message and return how many subscribers will receive it.
    pub async fn publish(&self, message: &M) -> Result<u64> {
        let payload = self.ctx.codec.encode(message)?;
        let groups = self.ctx.store.publish(&self.ctx.keys, payload).await?;
        metrics::record_published(&self.ctx.name);
        Ok(groups)
    }

    /// Register a listener and return its id.
    ///
    /// `kind` is either a payload kind (only matching messages are delivered)
    /// or [`ListenerKind::Any`]. The first registration elects this process's
    /// subscriber; if that fails the listener is removed again and the error
    /// returned.
    pub async fn add_listener<L>(
        &self,
        kind: impl Into<ListenerKind<M::Kind>>,
        listener: L,
    ) -> Result<String>
    where
        L: MessageListener<M>,
    {
        let id = self.ctx.registry.add(kind.into(), listener);
        metrics::set_listener_count(&self.ctx.name, self.ctx.registry.len());

        if let Err(e) = self.ctx.elect().await {
            self.ctx.registry.remove(&[&id]);
            metrics::set_listener_count(&self.ctx.name, self.ctx.registry.len());
            return Err(e);
        }
        Ok(id)
    }

    /// Remove listeners by id. Removing the last one tears the subscriber down.
    pub async fn remove_listener<I: AsRef<str>>(&self, ids: &[I]) -> Result<()> {
        let emptied = self.ctx.registry.remove(ids);
        metrics::set_listener_count(&self.ctx.name, self.ctx.registry.len());
        if emptied {
            self.ctx.teardown("drained").await?;
        }
        Ok(())
    }

    /// Remove every listener and tear the subscriber down.
    pub async fn remove_all_listeners(&self) -> Result<()> {
        self.ctx.registry.clear();
        metrics::set_listener_count(&self.ctx.name, 0);
        self.ctx.teardown("removed_all").await
    }

    /// Listeners registered in this process.
    pub fn count_listeners(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Subscribers across all processes (consumer groups on the log).
    pub async fn count_subscribers(&self) -> Result<u64> {
        self.ctx.store.count_groups(&self.ctx.keys).await
    }

    /// Messages currently retained in the log.
    pub async fn size(&self) -> Result<u64> {
        self.ctx.store.size(&self.ctx.keys).await
    }

    /// This process's subscriber id, if one is elected.
    pub async fn subscriber_id(&self) -> Option<String> {
        self.ctx.subscriber_id().await
    }

    /// Delete the log and the expiry index.
    pub async fn delete(&self) -> Result<bool> {
        let deleted = self.ctx.store.delete(&self.ctx.keys).await?;
        if deleted {
            info!(topic = %self.ctx.name, "Topic deleted");
        }
        Ok(deleted)
    }

    /// Expire both keys after `ttl`.
    pub async fn expire(&self, ttl: Duration) -> Result<bool> {
        self.ctx.store.expire(&self.ctx.keys, ttl).await
    }

    /// Expire both keys at `at`.
    pub async fn expire_at(&self, at: SystemTime) -> Result<bool> {
        let at_ms = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.ctx.store.expire_at(&self.ctx.keys, at_ms).await
    }

    /// Remove any expiry from both keys.
    pub async fn clear_expire(&self) -> Result<bool> {
        self.ctx.store.clear_expire(&self.ctx.keys).await
    }

    /// Approximate memory used by both keys, in bytes.
    pub async fn size_in_memory(&self) -> Result<u64> {
        self.ctx.store.size_in_memory(&self.ctx.keys).await
    }
}

impl<M: Payload, S: TopicStore> Drop for ReliableTopic<M, S> {
    fn drop(&mut self) {
        self.ctx.root.cancel();
    }
}

impl<M: Payload, S: TopicStore> std::fmt::Debug for ReliableTopic<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableTopic")
            .field("name", &self.ctx.name)
            .field("listeners", &self.ctx.registry.len())
            .finish()
    }
}
