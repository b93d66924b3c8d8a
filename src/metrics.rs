// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Publish and delivery throughput
//! - Subscriber elections, teardowns and lease renewals
//! - Poll errors and reconciliation latency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `reliable_topic_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a published message.
pub fn record_published(topic: &str) {
    counter!("reliable_topic_published_total", "topic" => topic.to_string()).increment(1);
}

/// Record entries returned by one read of the subscriber's group.
pub fn record_messages_read(topic: &str, count: usize) {
    counter!("reliable_topic_messages_read_total", "topic" => topic.to_string()).increment(count as u64);
}

/// Record listener callbacks invoked for a batch.
pub fn record_messages_delivered(topic: &str, count: usize) {
    counter!("reliable_topic_messages_delivered_total", "topic" => topic.to_string()).increment(count as u64);
}

/// Record a log entry that could not be decoded.
pub fn record_decode_failure(topic: &str) {
    counter!("reliable_topic_decode_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record a listener callback that panicked.
pub fn record_listener_panic(topic: &str) {
    counter!("reliable_topic_listener_panics_total", "topic" => topic.to_string()).increment(1);
}

/// Record a failed poll (read or reader open).
pub fn record_poll_error(topic: &str) {
    counter!("reliable_topic_poll_errors_total", "topic" => topic.to_string()).increment(1);
}

/// Record a lease renewal attempt outcome ("renewed", "lost", "error").
pub fn record_lease_renewal(topic: &str, outcome: &str) {
    counter!(
        "reliable_topic_lease_renewals_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a won election.
pub fn record_subscriber_elected(topic: &str) {
    counter!("reliable_topic_subscribers_elected_total", "topic" => topic.to_string()).increment(1);
}

/// Record a subscriber leaving ("drained", "lease_lost").
pub fn record_subscriber_removed(topic: &str, reason: &str) {
    counter!(
        "reliable_topic_subscribers_removed_total",
        "topic" => topic.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record one reconciliation pass.
pub fn record_reconcile(topic: &str, lease_alive: bool, duration: Duration) {
    let status = if lease_alive { "alive" } else { "lost" };
    counter!("reliable_topic_reconciles_total", "topic" => topic.to_string(), "status" => status).increment(1);
    histogram!("reliable_topic_reconcile_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for locally registered listeners.
pub fn set_listener_count(topic: &str, count: usize) {
    gauge!("reliable_topic_listeners", "topic" => topic.to_string()).set(count as f64);
}
