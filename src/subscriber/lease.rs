// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease renewal loop.
//!
//! Renews every `watchdog_timeout / 3`, so at least two attempts land inside
//! each timeout window. The loop ends on the first of:
//!
//! - cancellation (teardown or topic drop)
//! - the lease entry being gone (the subscriber was reaped; it is never recreated)
//! - a transport error (logged, not retried; the lease lapses and a peer's
//!   reconciliation reaps it)

use super::SubscriberContext;
use crate::listener::Payload;
use crate::metrics;
use crate::store::TopicStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Run the renewal loop until cancelled, lost, or failed.
pub(crate) async fn run<M: Payload, S: TopicStore>(
    ctx: Arc<SubscriberContext<M, S>>,
    subscriber_id: String,
    token: CancellationToken,
) {
    let period = ctx.settings.renewal_period;
    debug!(period_ms = period.as_millis() as u64, "Starting lease renewal");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let deadline = ctx.settings.lease_deadline();
        let renewed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = ctx.store.renew_lease(&ctx.keys, &subscriber_id, deadline) => result,
        };

        match renewed {
            Ok(true) => {
                trace!(deadline, "Lease renewed");
                metrics::record_lease_renewal(&ctx.name, "renewed");
            }
            Ok(false) => {
                metrics::record_lease_renewal(&ctx.name, "lost");
                ctx.release(&subscriber_id, &token).await;
                break;
            }
            Err(e) => {
                metrics::record_lease_renewal(&ctx.name, "error");
                error!(error = %e, "Lease renewal failed, lease will lapse");
                break;
            }
        }
    }

    debug!("Lease renewal stopped");
}
