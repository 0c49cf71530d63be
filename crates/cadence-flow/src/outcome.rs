//! Outcome application: success, retry, dead-letter.
//!
//! The outcome writer is the policy seat for the retry budget. The
//! delivery engine reports a single attempt's result; this component
//! decides the state transition and applies it as a lease-predicated
//! single-row write:
//!
//! - success -> `COMPLETED`
//! - retriable failure within budget -> back to `PENDING`
//! - retriable failure past budget, or terminal failure -> `DEAD_LETTER`
//!
//! A write that finds its lease re-claimed (expired mid-delivery and
//! recovered) is logged and counted, not retried: the re-claimant owns
//! the row now and will produce its own outcome.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, warn};

use cadence_core::ScheduledEvent;

use crate::delivery::DeliveryResult;
use crate::error::Result;
use crate::metrics::{labels as metric_labels, names as metric_names};
use crate::store::{EventStore, UpdateOutcome};

/// Applies delivery results to the store.
pub struct OutcomeWriter {
    store: Arc<dyn EventStore>,
}

impl OutcomeWriter {
    /// Creates a writer over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Applies the result of one delivery attempt for an event claimed by
    /// `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures; lease loss is handled
    /// internally.
    pub async fn apply(
        &self,
        event: &ScheduledEvent,
        worker_id: &str,
        result: &DeliveryResult,
    ) -> Result<()> {
        let now = Utc::now();
        let outcome = match result {
            DeliveryResult::Success => {
                let outcome = self.store.complete(event.id, worker_id, now).await?;
                if outcome.is_applied() {
                    counter!(metric_names::EVENTS_COMPLETED_TOTAL).increment(1);
                    debug!(event_id = %event.id, external_job_id = %event.external_job_id, "event completed");
                }
                ("complete", outcome)
            }
            DeliveryResult::Failure { error, retriable } => {
                if *retriable && event.can_retry() {
                    let outcome = self
                        .store
                        .fail_retriable(event.id, worker_id, error, now)
                        .await?;
                    if outcome.is_applied() {
                        counter!(metric_names::EVENTS_RETRIED_TOTAL).increment(1);
                        debug!(
                            event_id = %event.id,
                            retry_count = event.retry_count + 1,
                            max_retries = event.max_retries,
                            "event will be retried"
                        );
                    }
                    ("fail", outcome)
                } else {
                    let outcome = self
                        .store
                        .fail_terminal(event.id, worker_id, error, now)
                        .await?;
                    if outcome.is_applied() {
                        counter!(metric_names::EVENTS_DEAD_LETTER_TOTAL).increment(1);
                        warn!(
                            event_id = %event.id,
                            external_job_id = %event.external_job_id,
                            error = %error,
                            "event moved to dead letter"
                        );
                    }
                    ("fail", outcome)
                }
            }
        };

        match outcome {
            (operation, UpdateOutcome::LeaseLost) => {
                counter!(
                    metric_names::LEASE_LOST_TOTAL,
                    metric_labels::OPERATION => operation,
                )
                .increment(1);
                warn!(
                    event_id = %event.id,
                    worker_id,
                    operation,
                    "outcome write lost its lease; row re-claimed after expiry"
                );
            }
            (operation, UpdateOutcome::NotFound) => {
                warn!(event_id = %event.id, operation, "outcome write found no row");
            }
            (_, UpdateOutcome::Applied) => {}
        }

        Ok(())
    }
}
