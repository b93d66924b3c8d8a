// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Listener dispatch pool.
//!
//! Listener callbacks are plain synchronous functions and may be slow, so
//! they never run on the task that owns the blocking read. Each batch is
//! handed to `spawn_blocking` while holding a [`Bulkhead`] permit:
//!
//! ```text
//! poll loop ──submit(batch)──► acquire permit ──► spawn_blocking ──► listeners
//!     │                                                │
//!     └──► reconcile (does not wait)          permit released on completion
//! ```
//!
//! With one permit (the default) batch N+1 cannot start before batch N has
//! finished, so delivery follows log order. Wider pools trade ordering for
//! throughput.

use crate::config::DispatchConfig;
use crate::error::{Result, TopicError};
use crate::listener::{ListenerEntry, Payload};
use crate::metrics;
use crate::resilience::Bulkhead;
use tokio::task::JoinHandle;
use tracing::trace;

/// Bounded worker pool for listener callbacks.
#[derive(Debug)]
pub struct DispatchPool {
    bulkhead: Bulkhead,
}

impl DispatchPool {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            bulkhead: Bulkhead::new(config.max_concurrent_batches),
        }
    }

    /// Enqueue a job, waiting for a free slot.
    ///
    /// Returns once the job has been handed to a worker, not when it finishes.
    pub async fn submit<F>(&self, job: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self
            .bulkhead
            .acquire()
            .await
            .map_err(|e| TopicError::Internal(e.to_string()))?;

        Ok(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job();
        }))
    }

    /// Slots not currently running a batch.
    pub fn available(&self) -> usize {
        self.bulkhead.available()
    }
}

/// Fan a decoded batch out to a listener snapshot, oldest message first.
///
/// Returns the number of callbacks that ran to completion.
pub fn deliver_batch<M: Payload>(topic: &str, listeners: &[ListenerEntry<M>], messages: &[M]) -> usize {
    let mut delivered = 0;
    for message in messages {
        for listener in listeners {
            if listener.deliver(topic, message) {
                delivered += 1;
            }
        }
    }
    trace!(topic = %topic, messages = messages.len(), delivered, "Batch delivered");
    metrics::record_messages_delivered(topic, delivered);
    delivered
}
