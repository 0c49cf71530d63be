//! Observability metrics for the delivery pipeline.
//!
//! Metrics are exposed via the `metrics` crate facade; the binary installs
//! a Prometheus recorder and serves the rendered registry on `/metrics`.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `cadence_events_received_total` | Counter | - | Submissions accepted into the buffer |
//! | `cadence_events_persisted_total` | Counter | - | Rows inserted by the persister |
//! | `cadence_events_duplicate_total` | Counter | `tier` | Submissions suppressed as duplicates |
//! | `cadence_dlq_messages_total` | Counter | - | Messages routed to the ingestion DLQ |
//! | `cadence_events_claimed_total` | Counter | - | Events claimed by the poller |
//! | `cadence_deliveries_total` | Counter | `channel`, `result` | Delivery attempts by outcome |
//! | `cadence_delivery_duration_seconds` | Histogram | `channel` | Delivery attempt latency |
//! | `cadence_events_completed_total` | Counter | - | Events finished `COMPLETED` |
//! | `cadence_events_retried_total` | Counter | - | Events returned to `PENDING` |
//! | `cadence_events_dead_letter_total` | Counter | - | Events parked in `DEAD_LETTER` |
//! | `cadence_lease_lost_total` | Counter | `operation` | Outcome writes that lost their lease |
//! | `cadence_leases_released_total` | Counter | - | Expired leases released by recovery |
//! | `cadence_retention_deleted_total` | Counter | - | Terminal rows deleted by retention |
//! | `cadence_poll_tick_duration_seconds` | Histogram | - | Poll tick latency |
//! | `cadence_persist_batch_duration_seconds` | Histogram | - | Persister batch latency |

use std::time::{Duration, Instant};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Submissions accepted into the ingestion buffer.
    pub const EVENTS_RECEIVED_TOTAL: &str = "cadence_events_received_total";
    /// Counter: Rows inserted by the persister.
    pub const EVENTS_PERSISTED_TOTAL: &str = "cadence_events_persisted_total";
    /// Counter: Submissions suppressed as duplicates.
    pub const EVENTS_DUPLICATE_TOTAL: &str = "cadence_events_duplicate_total";
    /// Counter: Messages routed to the ingestion DLQ.
    pub const DLQ_MESSAGES_TOTAL: &str = "cadence_dlq_messages_total";
    /// Counter: Events claimed by the poller.
    pub const EVENTS_CLAIMED_TOTAL: &str = "cadence_events_claimed_total";
    /// Counter: Delivery attempts by channel and result.
    pub const DELIVERIES_TOTAL: &str = "cadence_deliveries_total";
    /// Histogram: Delivery attempt latency in seconds.
    pub const DELIVERY_DURATION_SECONDS: &str = "cadence_delivery_duration_seconds";
    /// Counter: Events finished COMPLETED.
    pub const EVENTS_COMPLETED_TOTAL: &str = "cadence_events_completed_total";
    /// Counter: Events returned to PENDING for another attempt.
    pub const EVENTS_RETRIED_TOTAL: &str = "cadence_events_retried_total";
    /// Counter: Events parked in DEAD_LETTER.
    pub const EVENTS_DEAD_LETTER_TOTAL: &str = "cadence_events_dead_letter_total";
    /// Counter: Outcome writes that found their lease re-claimed.
    pub const LEASE_LOST_TOTAL: &str = "cadence_lease_lost_total";
    /// Counter: Expired leases released by the recovery loop.
    pub const LEASES_RELEASED_TOTAL: &str = "cadence_leases_released_total";
    /// Counter: Terminal rows deleted by retention.
    pub const RETENTION_DELETED_TOTAL: &str = "cadence_retention_deleted_total";
    /// Histogram: Poll tick latency in seconds.
    pub const POLL_TICK_DURATION_SECONDS: &str = "cadence_poll_tick_duration_seconds";
    /// Histogram: Persister batch latency in seconds.
    pub const PERSIST_BATCH_DURATION_SECONDS: &str = "cadence_persist_batch_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Delivery channel (`http`, `kafka`).
    pub const CHANNEL: &str = "channel";
    /// Attempt result (`success`, `retriable`, `terminal`).
    pub const RESULT: &str = "result";
    /// Dedup tier that suppressed a message (`lru`, `store`, `constraint`).
    pub const TIER: &str = "tier";
    /// Store operation that lost its lease (`complete`, `fail`).
    pub const OPERATION: &str = "operation";
}

/// Records a duration into a callback when dropped.
///
/// Wraps the start-instant bookkeeping for histogram observations:
///
/// ```rust
/// use cadence_flow::metrics::TimingGuard;
/// use metrics::histogram;
///
/// let _guard = TimingGuard::new(|duration| {
///     histogram!("cadence_poll_tick_duration_seconds").record(duration.as_secs_f64());
/// });
/// // ... timed work
/// ```
pub struct TimingGuard<F: FnOnce(Duration)> {
    start: Instant,
    observe: Option<F>,
}

impl<F: FnOnce(Duration)> TimingGuard<F> {
    /// Starts timing; `observe` runs with the elapsed duration on drop.
    #[must_use]
    pub fn new(observe: F) -> Self {
        Self {
            start: Instant::now(),
            observe: Some(observe),
        }
    }
}

impl<F: FnOnce(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        if let Some(observe) = self.observe.take() {
            observe(self.start.elapsed());
        }
    }
}
