//! Pluggable storage for scheduled events.
//!
//! The [`EventStore`] trait defines the persistence layer for the event
//! table. Two implementations are provided:
//!
//! - [`memory::InMemoryEventStore`]: in-process store for tests
//! - [`postgres::PostgresEventStore`]: partitioned Postgres table with
//!   skip-locked claiming for production
//!
//! ## Design Principles
//!
//! - **Leases, not ownership**: workers claim rows under a time-bounded
//!   lease (`locked_by` + `lock_expires_at`); the store owns the row
//! - **Predicated transitions**: outcome writes carry the claiming worker
//!   identity and apply only while that worker still holds the lease
//! - **Discriminated results**: duplicate inserts, lost leases and invalid
//!   cancellations are values, not errors

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{DeliveryType, EventId, EventStatus, ScheduledEvent};

use crate::error::Result;

/// A row to be inserted, as produced by the persister.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Caller-supplied job identifier.
    pub external_job_id: String,
    /// Caller-supplied origin tag.
    pub source: String,
    /// Instant at which delivery becomes eligible.
    pub scheduled_at: DateTime<Utc>,
    /// Delivery channel.
    pub delivery_type: DeliveryType,
    /// URL (HTTP) or topic name (KAFKA).
    pub destination: String,
    /// Opaque JSON text.
    pub payload: String,
    /// Retry budget.
    pub max_retries: i32,
}

/// Result of inserting a new event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was persisted with the assigned ID.
    Inserted(EventId),
    /// The dedup key `(external_job_id, source, scheduled_at)` collided;
    /// the submission is suppressed as an idempotent duplicate.
    Duplicate,
}

impl InsertOutcome {
    /// Returns true if a new row was persisted.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Result of a lease-predicated single-row transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The transition was applied.
    Applied,
    /// The row exists but is no longer held by the caller; an expired
    /// lease was recovered and possibly re-claimed by another worker.
    LeaseLost,
    /// No row with this ID exists.
    NotFound,
}

impl UpdateOutcome {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The event was cancelled.
    Cancelled,
    /// The event is not `PENDING`; cancellation is not possible.
    InvalidState(EventStatus),
    /// No event with this ID exists.
    NotFound,
}

/// Aggregate event counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    /// Events waiting for their scheduled time.
    pub pending: u64,
    /// Events currently claimed under a lease.
    pub processing: u64,
    /// Events delivered successfully.
    pub completed: u64,
    /// Events that exhausted retries or failed non-retriably.
    pub dead_letter: u64,
    /// Events cancelled before delivery.
    pub cancelled: u64,
}

impl StatusCounts {
    /// Total events across all statuses.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead_letter + self.cancelled
    }

    /// Adds a count for the given status.
    pub fn record(&mut self, status: EventStatus, count: u64) {
        match status {
            EventStatus::Pending => self.pending += count,
            EventStatus::Processing => self.processing += count,
            EventStatus::Completed => self.completed += count,
            EventStatus::DeadLetter => self.dead_letter += count,
            EventStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// Storage abstraction for the scheduled event table.
///
/// ## Claim Semantics
///
/// `claim_due` is the only cross-process coordination primitive in the
/// system: concurrent callers must receive disjoint batches without
/// blocking each other (skip-locked row locking in Postgres, a single
/// mutation lock in memory).
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// poller, the persister pool and the maintenance loops.
#[async_trait]
pub trait EventStore: Send + Sync {
    // --- Ingestion ---

    /// Persists a new event with status `PENDING`.
    ///
    /// A dedup-key collision returns `InsertOutcome::Duplicate` rather
    /// than an error; the unique constraint is the final backstop behind
    /// the deduplicator's two tiers.
    async fn insert(&self, event: NewEvent) -> Result<InsertOutcome>;

    /// Returns true if a row with this dedup key exists.
    async fn exists_by_dedup_key(
        &self,
        external_job_id: &str,
        source: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool>;

    // --- Claiming and outcomes ---

    /// Atomically claims up to `limit` due events for `worker_id`.
    ///
    /// Selects rows with `status = PENDING`, `scheduled_at <= now` and no
    /// live lease, ordered by `scheduled_at` ascending, skipping rows
    /// locked by a concurrent claim; transitions them to `PROCESSING`
    /// with the given lease deadline and returns them.
    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEvent>>;

    /// Records a successful delivery: `PROCESSING -> COMPLETED`.
    ///
    /// Applies only while `worker_id` still holds the lease.
    async fn complete(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;

    /// Records a retriable failure: `PROCESSING -> PENDING` with the
    /// attempt counted and `last_error` recorded.
    async fn fail_retriable(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;

    /// Records a terminal failure: `PROCESSING -> DEAD_LETTER`.
    async fn fail_terminal(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;

    /// Returns a prematurely-claimed event to `PENDING` without counting
    /// an attempt.
    async fn reschedule_unclaim(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome>;

    // --- Maintenance ---

    /// Releases all expired leases back to `PENDING`; returns the count.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Deletes up to `batch_size` terminal rows with
    /// `executed_at < cutoff`; returns the count deleted.
    async fn delete_terminal_batch(&self, cutoff: DateTime<Utc>, batch_size: usize) -> Result<u64>;

    /// Performs store-specific periodic maintenance (partition
    /// pre-creation in Postgres). The default implementation does nothing.
    async fn run_maintenance(&self, _now: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    // --- Admin / query ---

    /// Looks up an event by ID.
    async fn get_by_id(&self, id: EventId) -> Result<Option<ScheduledEvent>>;

    /// Looks up the most recently created event for an external job ID.
    async fn get_by_external_job_id(&self, external_job_id: &str)
        -> Result<Option<ScheduledEvent>>;

    /// Lists all events for an external job ID, newest first.
    async fn list_by_external_job_id(&self, external_job_id: &str) -> Result<Vec<ScheduledEvent>>;

    /// Cancels a `PENDING` event by ID.
    async fn cancel_by_id(&self, id: EventId, now: DateTime<Utc>) -> Result<CancelOutcome>;

    /// Cancels all `PENDING` events for an external job ID; returns the
    /// affected count.
    async fn cancel_by_external_job_id(
        &self,
        external_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Aggregates event counts by status. Full-scan aggregate; admin use
    /// only.
    async fn status_counts(&self) -> Result<StatusCounts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_outcome_is_inserted() {
        assert!(InsertOutcome::Inserted(EventId::generate()).is_inserted());
        assert!(!InsertOutcome::Duplicate.is_inserted());
    }

    #[test]
    fn update_outcome_is_applied() {
        assert!(UpdateOutcome::Applied.is_applied());
        assert!(!UpdateOutcome::LeaseLost.is_applied());
        assert!(!UpdateOutcome::NotFound.is_applied());
    }

    #[test]
    fn status_counts_totals() {
        let mut counts = StatusCounts::default();
        counts.record(EventStatus::Pending, 3);
        counts.record(EventStatus::Completed, 2);
        counts.record(EventStatus::DeadLetter, 1);
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.pending, 3);
    }
}
