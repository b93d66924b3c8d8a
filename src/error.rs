// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for reliable topics.
//!
//! Errors are categorized by their source and carry enough context to tell
//! a flaky network apart from a subscriber that has been reaped.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `Codec` | No | Payload could not be encoded or decoded |
//! | `Config` | No | Configuration invalid |
//! | `LeaseLost` | No | Subscriber lease or consumer group no longer exists |
//! | `Shutdown` | No | Topic is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Background Loops
//!
//! Only foreground calls (publish, listener management, passthroughs) return
//! these errors to the caller. The poll and lease loops log them and either
//! retry (`Redis` in the poll loop) or stop (`LeaseLost`, `Shutdown`).

use thiserror::Error;

/// Result type alias for topic operations.
pub type Result<T> = std::result::Result<T, TopicError>;

/// Errors that can occur while publishing or subscribing.
#[derive(Error, Debug)]
pub enum TopicError {
    /// Redis connection or command error.
    ///
    /// Transient transport failure. The poll loop retries these after a
    /// fixed backoff; the lease loop does not.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Payload encode/decode failure.
    ///
    /// Not retryable - the bytes on the log will not change.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The subscriber's lease entry (or its consumer group) is gone.
    ///
    /// Fatal to that subscriber's loops. Recovery requires a fresh election;
    /// a reaped subscriber is never resurrected.
    #[error("Lease lost for subscriber {subscriber_id}")]
    LeaseLost { subscriber_id: String },

    /// Local teardown in progress.
    ///
    /// Treated as ordinary cancellation, never logged as a failure.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TopicError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a lease-lost error for a subscriber.
    pub fn lease_lost(subscriber_id: impl Into<String>) -> Self {
        Self::LeaseLost {
            subscriber_id: subscriber_id.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true, // Network errors are retryable
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::LeaseLost { .. } => false, // Needs a fresh election
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error means the subscriber is gone for good.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}

impl From<redis::RedisError> for TopicError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
