// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for reliable topics.
//!
//! Configuration is passed to [`ReliableTopic::new()`](crate::ReliableTopic::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use reliable_topic::config::TopicConfig;
//!
//! let config = TopicConfig {
//!     redis_url: "redis://cache:6379".into(),
//!     watchdog_timeout: "30s".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! TopicConfig
//! ├── redis_url: String             # Backing Redis
//! ├── watchdog_timeout: String      # Subscriber lease length ("10m")
//! ├── poll_retry_delay: String      # Backoff after a failed read ("1s")
//! ├── read_count: Option<usize>     # Max entries per XREADGROUP (None = all)
//! └── dispatch: DispatchConfig
//!     └── max_concurrent_batches    # Listener worker pool width
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! redis_url: "redis://cache:6379"
//! watchdog_timeout: "10m"
//! poll_retry_delay: "1s"
//! dispatch:
//!   max_concurrent_batches: 1
//! ```

use crate::error::{Result, TopicError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest watchdog timeout that still leaves a non-zero renewal period.
const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(3);

// ═══════════════════════════════════════════════════════════════════════════════
// TopicConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings shared by every subscriber of a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Redis URL used by [`RedisStore::connect`](crate::store::redis::RedisStore::connect).
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Subscriber lease length as a duration string (e.g., "10m").
    ///
    /// A subscriber that does not renew within this window is reaped by
    /// the next reconciliation pass of any process. Renewal fires every
    /// third of this value.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: String,

    /// Fixed delay before re-polling after a failed read (e.g., "1s").
    #[serde(default = "default_poll_retry_delay")]
    pub poll_retry_delay: String,

    /// Maximum entries fetched per read. `None` reads everything pending.
    #[serde(default)]
    pub read_count: Option<usize>,

    /// Listener worker pool settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_watchdog_timeout() -> String {
    "10m".to_string()
}

fn default_poll_retry_delay() -> String {
    "1s".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            watchdog_timeout: default_watchdog_timeout(),
            poll_retry_delay: default_poll_retry_delay(),
            read_count: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl TopicConfig {
    /// Create a config with short timers for tests.
    pub fn for_testing(watchdog_timeout: &str) -> Self {
        Self {
            watchdog_timeout: watchdog_timeout.to_string(),
            poll_retry_delay: "50ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse the watchdog timeout to a Duration.
    pub fn watchdog_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.watchdog_timeout).unwrap_or(Duration::from_secs(600))
    }

    /// How often the lease loop renews (watchdog timeout / 3).
    ///
    /// Guarantees at least two renewal attempts per lease window.
    pub fn renewal_period(&self) -> Duration {
        self.watchdog_timeout_duration() / 3
    }

    /// Parse the poll retry delay to a Duration.
    pub fn poll_retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_retry_delay).unwrap_or(Duration::from_secs(1))
    }

    /// Check the config for values the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let watchdog = humantime::parse_duration(&self.watchdog_timeout).map_err(|e| {
            TopicError::Config(format!(
                "invalid watchdog_timeout '{}': {}",
                self.watchdog_timeout, e
            ))
        })?;
        if watchdog < MIN_WATCHDOG_TIMEOUT {
            return Err(TopicError::Config(format!(
                "watchdog_timeout must be at least {:?}, got {:?}",
                MIN_WATCHDOG_TIMEOUT, watchdog
            )));
        }

        humantime::parse_duration(&self.poll_retry_delay).map_err(|e| {
            TopicError::Config(format!(
                "invalid poll_retry_delay '{}': {}",
                self.poll_retry_delay, e
            ))
        })?;

        if self.read_count == Some(0) {
            return Err(TopicError::Config("read_count must be greater than 0".to_string()));
        }

        if self.dispatch.max_concurrent_batches == 0 {
            return Err(TopicError::Config(
                "dispatch.max_concurrent_batches must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Listener worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How many batches may run listener callbacks at once.
    ///
    /// With the default of 1, batches are delivered strictly in log order.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_max_concurrent_batches() -> usize {
    1
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TopicConfig::default();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.watchdog_timeout_duration(), Duration::from_secs(600));
        assert_eq!(config.poll_retry_delay_duration(), Duration::from_secs(1));
        assert_eq!(config.read_count, None);
        assert_eq!(config.dispatch.max_concurrent_batches, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_renewal_period_is_a_third() {
        let config = TopicConfig {
            watchdog_timeout: "30s".to_string(),
            ..Default::default()
        };
        assert_eq!(config.renewal_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_watchdog_timeout_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("300ms", Duration::from_millis(300)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = TopicConfig {
                watchdog_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.watchdog_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_durations_fall_back() {
        let config = TopicConfig {
            watchdog_timeout: "soon".to_string(),
            poll_retry_delay: "later".to_string(),
            ..Default::default()
        };
        assert_eq!(config.watchdog_timeout_duration(), Duration::from_secs(600));
        assert_eq!(config.poll_retry_delay_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_watchdog = TopicConfig {
            watchdog_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_watchdog.validate(), Err(TopicError::Config(_))));

        let tiny_watchdog = TopicConfig {
            watchdog_timeout: "1ms".to_string(),
            ..Default::default()
        };
        assert!(tiny_watchdog.validate().is_err());

        let bad_retry = TopicConfig {
            poll_retry_delay: "later".to_string(),
            ..Default::default()
        };
        assert!(bad_retry.validate().is_err());

        let zero_count = TopicConfig {
            read_count: Some(0),
            ..Default::default()
        };
        assert!(zero_count.validate().is_err());

        let zero_pool = TopicConfig {
            dispatch: DispatchConfig {
                max_concurrent_batches: 0,
            },
            ..Default::default()
        };
        assert!(zero_pool.validate().is_err());
    }

    #[test]
    fn test_for_testing_config() {
        let config = TopicConfig::for_testing("300ms");
        assert_eq!(config.watchdog_timeout_duration(), Duration::from_millis(300));
        assert_eq!(config.renewal_period(), Duration::from_millis(100));
        assert_eq!(config.poll_retry_delay_duration(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_defaults() {
        let parsed: TopicConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.watchdog_timeout, "10m");
        assert_eq!(parsed.poll_retry_delay, "1s");
        assert_eq!(parsed.dispatch.max_concurrent_batches, 1);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = TopicConfig {
            redis_url: "redis://cache:6379".to_string(),
            watchdog_timeout: "45s".to_string(),
            poll_retry_delay: "250ms".to_string(),
            read_count: Some(64),
            dispatch: DispatchConfig {
                max_concurrent_batches: 4,
            },
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: TopicConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.redis_url, "redis://cache:6379");
        assert_eq!(parsed.watchdog_timeout, "45s");
        assert_eq!(parsed.poll_retry_delay, "250ms");
        assert_eq!(parsed.read_count, Some(64));
        assert_eq!(parsed.dispatch.max_concurrent_batches, 4);
    }
}
