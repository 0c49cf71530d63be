//! Retention: batched deletion of old terminal events.
//!
//! Runs on a cron cadence (default daily at 02:00). Deletes terminal rows
//! older than the retention cutoff in bounded batches with a short pause
//! between full batches, so a large backlog cannot monopolize the store.
//! Interruption is safe: deleted rows are gone, remaining rows are
//! untouched, and the next run picks up where this one stopped.
//!
//! The pass also runs store maintenance (partition pre-creation), keeping
//! the partition horizon ahead of the schedule without DB-side triggers.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::names as metric_names;
use crate::store::EventStore;

/// Safety cap on delete iterations per pass.
const MAX_ITERATIONS: u32 = 1000;

/// Pause between consecutive full batches.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Retention cadence and sizing.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Cron expression for the cleanup schedule (seconds-resolution,
    /// e.g. `0 0 2 * * *`).
    pub cron_expression: String,
    /// Timezone the cron expression is evaluated in.
    pub timezone: Tz,
    /// Events older than this many days are eligible for deletion.
    pub retention_days: u32,
    /// Rows deleted per batch.
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cron_expression: "0 0 2 * * *".to_string(),
            timezone: chrono_tz::UTC,
            retention_days: 7,
            batch_size: 10_000,
        }
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupResult {
    /// Total rows deleted.
    pub deleted: u64,
    /// The cutoff that was applied.
    pub cutoff: DateTime<Utc>,
}

/// Computes the next fire instant of a schedule after `after`, in UTC.
#[must_use]
pub fn next_fire(schedule: &Schedule, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
}

/// Cron-cadenced retention loop.
pub struct RetentionLoop {
    store: Arc<dyn EventStore>,
    config: RetentionConfig,
    schedule: Schedule,
}

impl RetentionLoop {
    /// Creates a retention loop, parsing the cron expression.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid cron expression;
    /// treat as a fatal startup failure.
    pub fn new(store: Arc<dyn EventStore>, config: RetentionConfig) -> Result<Self> {
        let schedule = Schedule::from_str(&config.cron_expression).map_err(|e| {
            Error::configuration(format!(
                "invalid cleanup cron expression '{}': {e}",
                config.cron_expression
            ))
        })?;
        Ok(Self {
            store,
            config,
            schedule,
        })
    }

    /// Runs until cancelled, firing on the configured cron schedule.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let Some(fire_at) = next_fire(&self.schedule, self.config.timezone, Utc::now()) else {
                warn!("cleanup schedule has no future fire times; retention loop exiting");
                return;
            };
            let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(fire_at = %fire_at, "next retention pass scheduled");

            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("retention loop shutting down");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }

            match self.cleanup(self.config.retention_days).await {
                Ok(result) => {
                    info!(deleted = result.deleted, cutoff = %result.cutoff, "retention pass completed");
                }
                Err(e) => error!(error = %e, "retention pass failed"),
            }

            if let Err(e) = self.store.run_maintenance(Utc::now()).await {
                error!(error = %e, "store maintenance failed");
            }
        }
    }

    /// Deletes terminal events older than `days` days, in batches, until a
    /// short batch or the iteration cap.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete batch fails; rows already deleted stay
    /// deleted.
    pub async fn cleanup(&self, days: u32) -> Result<CleanupResult> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        info!(days, cutoff = %cutoff, "starting cleanup of old events");

        let mut deleted_total: u64 = 0;
        let mut iterations: u32 = 0;
        loop {
            let deleted = self
                .store
                .delete_terminal_batch(cutoff, self.config.batch_size)
                .await?;
            deleted_total += deleted;
            iterations += 1;

            if deleted > 0 {
                debug!(batch = deleted, total = deleted_total, "deleted batch of old events");
            }

            if deleted < self.config.batch_size as u64 {
                break;
            }
            if iterations >= MAX_ITERATIONS {
                warn!(iterations, deleted_total, "cleanup stopped at the iteration cap");
                break;
            }
            tokio::time::sleep(BATCH_PAUSE).await;
        }

        counter!(metric_names::RETENTION_DELETED_TOTAL).increment(deleted_total);
        info!(deleted = deleted_total, iterations, "cleanup completed");
        Ok(CleanupResult {
            deleted: deleted_total,
            cutoff,
        })
    }
}
