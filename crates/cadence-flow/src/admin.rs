//! Admin and query surface over the store.
//!
//! Lookups, cancellation and statistics for the REST façade. These are
//! thin pass-throughs by design: the store owns the transition rules, and
//! the statistics aggregate is a full scan intended for admin use only.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use cadence_core::{EventId, ScheduledEvent};

use crate::error::Result;
use crate::retention::{CleanupResult, RetentionLoop};
use crate::store::{CancelOutcome, EventStore, StatusCounts};

/// Lookup, cancellation and statistics operations.
pub struct AdminService {
    store: Arc<dyn EventStore>,
    retention: Arc<RetentionLoop>,
}

impl AdminService {
    /// Creates the service over the store and the retention loop (whose
    /// drain routine backs manual cleanup).
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, retention: Arc<RetentionLoop>) -> Self {
        Self { store, retention }
    }

    /// Looks up an event by ID.
    pub async fn get_event(&self, id: EventId) -> Result<Option<ScheduledEvent>> {
        self.store.get_by_id(id).await
    }

    /// Looks up the most recent event for an external job ID.
    pub async fn get_event_by_external_job_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ScheduledEvent>> {
        self.store.get_by_external_job_id(external_job_id).await
    }

    /// Lists all events for an external job ID, newest first.
    pub async fn list_events_by_external_job_id(
        &self,
        external_job_id: &str,
    ) -> Result<Vec<ScheduledEvent>> {
        self.store.list_by_external_job_id(external_job_id).await
    }

    /// Cancels a `PENDING` event by ID.
    pub async fn cancel_event(&self, id: EventId) -> Result<CancelOutcome> {
        let outcome = self.store.cancel_by_id(id, Utc::now()).await?;
        if outcome == CancelOutcome::Cancelled {
            info!(event_id = %id, "event cancelled");
        }
        Ok(outcome)
    }

    /// Cancels all `PENDING` events for an external job ID; returns the
    /// affected count.
    pub async fn cancel_events_by_external_job_id(&self, external_job_id: &str) -> Result<u64> {
        let cancelled = self
            .store
            .cancel_by_external_job_id(external_job_id, Utc::now())
            .await?;
        if cancelled > 0 {
            info!(external_job_id, cancelled, "events cancelled by external job ID");
        }
        Ok(cancelled)
    }

    /// Aggregates event counts by status.
    pub async fn statistics(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }

    /// Runs retention cleanup with an explicit retention window.
    pub async fn manual_cleanup(&self, days: u32) -> Result<CleanupResult> {
        info!(days, "manual cleanup triggered");
        self.retention.cleanup(days).await
    }
}
