//! Postgres event store.
//!
//! Production [`EventStore`] implementation over a partitioned table.
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a single locking CTE so
//! that N workers claim disjoint batches without blocking each other;
//! outcome writes are predicated on the claiming worker still holding the
//! lease, which closes the lost-update window between lease expiry and a
//! late completion.
//!
//! Partition maintenance lives here rather than in DB triggers:
//! [`PostgresEventStore::ensure_partitions`] pre-creates ten-day-key range
//! partitions covering the current and next year, and is re-run by the
//! retention loop.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use cadence_core::{EventId, ScheduledEvent};

use super::{CancelOutcome, EventStore, InsertOutcome, NewEvent, StatusCounts, UpdateOutcome};
use crate::error::{Error, Result};

const EVENT_COLUMNS: &str = "id, external_job_id, source, scheduled_at, delivery_type, \
     destination, payload::text AS payload, status, retry_count, max_retries, last_error, \
     created_at, updated_at, executed_at, locked_by, lock_expires_at, partition_key";

/// Postgres-backed [`EventStore`].
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a migration fails; the caller should
    /// treat this as a fatal startup failure.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::storage_with_source("schema migration failed", e))
    }

    /// Pre-creates range partitions covering `now`'s year and the next.
    ///
    /// Idempotent (`CREATE TABLE IF NOT EXISTS`); safe to run from every
    /// instance concurrently.
    pub async fn ensure_partitions(&self, now: DateTime<Utc>) -> Result<()> {
        for start in partition_bucket_starts(now.year()) {
            let statement = partition_ddl(start);
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Distinguishes a lost lease from a missing row after a zero-row
    /// predicated update.
    async fn classify_missed_update(&self, id: EventId) -> Result<UpdateOutcome> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM scheduled_events WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(UpdateOutcome::LeaseLost)
        } else {
            Ok(UpdateOutcome::NotFound)
        }
    }
}

/// Returns the inclusive lower bounds of the ten-day-key partitions
/// covering `year` and `year + 1`.
fn partition_bucket_starts(year: i32) -> Vec<i32> {
    let mut starts = Vec::new();
    for y in [year, year + 1] {
        // Ordinals run 1..=366; buckets of ten day-keys never straddle a
        // year boundary because year * 1000 is a multiple of 10.
        let mut start = y * 1000;
        while start <= y * 1000 + 366 {
            starts.push(start);
            start += 10;
        }
    }
    starts
}

fn partition_ddl(start: i32) -> String {
    let end = start + 10;
    format!(
        "CREATE TABLE IF NOT EXISTS scheduled_events_p{start} \
         PARTITION OF scheduled_events FOR VALUES FROM ({start}) TO ({end})"
    )
}

fn event_from_row(row: &PgRow) -> Result<ScheduledEvent> {
    let id: Uuid = row.try_get("id")?;
    let delivery_type: String = row.try_get("delivery_type")?;
    let status: String = row.try_get("status")?;
    Ok(ScheduledEvent {
        id: EventId::from_uuid(id),
        external_job_id: row.try_get("external_job_id")?,
        source: row.try_get("source")?,
        scheduled_at: row.try_get("scheduled_at")?,
        delivery_type: delivery_type.parse()?,
        destination: row.try_get("destination")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        executed_at: row.try_get("executed_at")?,
        locked_by: row.try_get("locked_by")?,
        lock_expires_at: row.try_get("lock_expires_at")?,
        partition_key: row.try_get("partition_key")?,
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert(&self, event: NewEvent) -> Result<InsertOutcome> {
        let partition_key = ScheduledEvent::partition_key_for(event.scheduled_at);
        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO scheduled_events \
                 (external_job_id, source, scheduled_at, delivery_type, destination, \
                  payload, status, retry_count, max_retries, partition_key) \
             VALUES ($1, $2, $3, $4, $5, $6::jsonb, 'PENDING', 0, $7, $8) \
             ON CONFLICT (external_job_id, source, scheduled_at, partition_key) DO NOTHING \
             RETURNING id",
        )
        .bind(&event.external_job_id)
        .bind(&event.source)
        .bind(event.scheduled_at)
        .bind(event.delivery_type.as_str())
        .bind(&event.destination)
        .bind(&event.payload)
        .bind(event.max_retries)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(id) => InsertOutcome::Inserted(EventId::from_uuid(id)),
            None => InsertOutcome::Duplicate,
        })
    }

    async fn exists_by_dedup_key(
        &self,
        external_job_id: &str,
        source: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(\
                 SELECT 1 FROM scheduled_events \
                 WHERE external_job_id = $1 AND source = $2 AND scheduled_at = $3)",
        )
        .bind(external_job_id)
        .bind(source)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "WITH due AS (\
                 SELECT id, partition_key FROM scheduled_events \
                 WHERE status = 'PENDING' \
                   AND scheduled_at <= $1 \
                   AND (lock_expires_at IS NULL OR lock_expires_at < $1) \
                 ORDER BY scheduled_at ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             UPDATE scheduled_events e \
             SET status = 'PROCESSING', locked_by = $3, lock_expires_at = $4, updated_at = $1 \
             FROM due \
             WHERE e.id = due.id AND e.partition_key = due.partition_key \
             RETURNING e.id, e.external_job_id, e.source, e.scheduled_at, e.delivery_type, \
                       e.destination, e.payload::text AS payload, e.status, e.retry_count, \
                       e.max_retries, e.last_error, e.created_at, e.updated_at, e.executed_at, \
                       e.locked_by, e.lock_expires_at, e.partition_key",
        )
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(event_from_row(row)?);
        }
        // The UPDATE does not preserve the CTE's ordering.
        events.sort_by_key(|e| e.scheduled_at);
        Ok(events)
    }

    async fn complete(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'COMPLETED', executed_at = $3, updated_at = $3, \
                 locked_by = NULL, lock_expires_at = NULL \
             WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(UpdateOutcome::Applied)
        } else {
            self.classify_missed_update(id).await
        }
    }

    async fn fail_retriable(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'PENDING', retry_count = retry_count + 1, \
                 last_error = left($3, 4000), updated_at = $4, \
                 locked_by = NULL, lock_expires_at = NULL \
             WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(UpdateOutcome::Applied)
        } else {
            self.classify_missed_update(id).await
        }
    }

    async fn fail_terminal(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'DEAD_LETTER', retry_count = retry_count + 1, \
                 last_error = left($3, 4000), executed_at = $4, updated_at = $4, \
                 locked_by = NULL, lock_expires_at = NULL \
             WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(UpdateOutcome::Applied)
        } else {
            self.classify_missed_update(id).await
        }
    }

    async fn reschedule_unclaim(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'PENDING', locked_by = NULL, lock_expires_at = NULL, updated_at = $3 \
             WHERE id = $1 AND status = 'PROCESSING' AND locked_by = $2",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(UpdateOutcome::Applied)
        } else {
            self.classify_missed_update(id).await
        }
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'PENDING', locked_by = NULL, lock_expires_at = NULL, updated_at = $1 \
             WHERE status = 'PROCESSING' AND lock_expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_terminal_batch(&self, cutoff: DateTime<Utc>, batch_size: usize) -> Result<u64> {
        let batch_size = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "DELETE FROM scheduled_events \
             WHERE (id, partition_key) IN (\
                 SELECT id, partition_key FROM scheduled_events \
                 WHERE status IN ('COMPLETED', 'DEAD_LETTER', 'CANCELLED') \
                   AND executed_at < $1 \
                 LIMIT $2)",
        )
        .bind(cutoff)
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_partitions(now).await
    }

    async fn get_by_id(&self, id: EventId) -> Result<Option<ScheduledEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM scheduled_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn get_by_external_job_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ScheduledEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM scheduled_events \
             WHERE external_job_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(external_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_by_external_job_id(&self, external_job_id: &str) -> Result<Vec<ScheduledEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM scheduled_events \
             WHERE external_job_id = $1 \
             ORDER BY created_at DESC"
        ))
        .bind(external_job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn cancel_by_id(&self, id: EventId, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'CANCELLED', executed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM scheduled_events WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some(status) => Ok(CancelOutcome::InvalidState(status.parse()?)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn cancel_by_external_job_id(
        &self,
        external_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_events \
             SET status = 'CANCELLED', executed_at = $2, updated_at = $2 \
             WHERE external_job_id = $1 AND status = 'PENDING'",
        )
        .bind(external_job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM scheduled_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.record(status.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}
