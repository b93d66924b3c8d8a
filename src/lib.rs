// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Reliable Topic
//!
//! At-least-once publish/subscribe over Redis Streams consumer groups.
//!
//! ## Architecture
//!
//! Each process that listens on a topic elects one subscriber. The subscriber
//! owns a consumer group on the topic's log and a lease in the topic's expiry
//! index, and fans every message out to the local listeners:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           ReliableTopic (per process)                     │
//! │                                                                           │
//! │  ┌──────────────────┐   first listener   ┌─────────────────────────────┐  │
//! │  │ ListenerRegistry │──────────────────► │ SubscriberSlot (elect/tear) │  │
//! │  └──────────────────┘                    └─────────────────────────────┘  │
//! │          ▲ snapshot                          │                 │          │
//! │          │                                   ▼                 ▼          │
//! │  ┌──────────────┐  batch   ┌──────────────────────┐   ┌───────────────┐   │
//! │  │ DispatchPool │◄─────────│ Poll loop            │   │ Lease loop    │   │
//! │  │ (callbacks)  │          │ (read/dispatch/trim) │   │ (renew T/3)   │   │
//! │  └──────────────┘          └──────────────────────┘   └───────────────┘   │
//! └───────────────────────────────────────│───────────────────────│───────────┘
//!                                         ▼                       ▼
//!                     ┌─────────────────────────────────────────────────────┐
//!                     │ Redis: {name} stream + {name}:timeout sorted set    │
//!                     │ (one consumer group + one lease per subscriber)     │
//!                     └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - Every live subscriber sees every message published after it was
//!   elected, plus anything still retained in the log when it joined.
//! - The log is trimmed only below the slowest live subscriber's cursor, so
//!   a crash between dispatch and reconciliation causes redelivery, not loss.
//! - A subscriber whose lease lapses is reaped by any other subscriber's
//!   reconciliation and never resurrected.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reliable_topic::{ListenerKind, Payload, ReliableTopic, TopicConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct PriceChanged { sku: String, cents: u64 }
//!
//! impl Payload for PriceChanged {
//!     type Kind = ();
//!     fn kind(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> reliable_topic::Result<()> {
//!     let topic: ReliableTopic<PriceChanged> =
//!         ReliableTopic::connect("prices", TopicConfig::default()).await?;
//!
//!     topic
//!         .add_listener(ListenerKind::Any, |_topic: &str, p: &PriceChanged| {
//!             println!("{} now costs {}", p.sku, p.cents);
//!         })
//!         .await?;
//!
//!     topic.publish(&PriceChanged { sku: "A-1".into(), cents: 999 }).await?;
//!
//!     topic.remove_all_listeners().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod resilience;
pub mod store;
pub(crate) mod subscriber;
pub mod topic;

// Re-exports for convenience
pub use codec::{Codec, CompressedCodec, JsonCodec};
pub use config::{DispatchConfig, TopicConfig};
pub use error::{Result, TopicError};
pub use listener::{ListenerKind, MessageListener, Payload};
pub use store::memory::MemoryStore;
pub use store::redis::RedisStore;
pub use store::{StoreOp, TopicKeys, TopicStore};
pub use topic::ReliableTopic;
