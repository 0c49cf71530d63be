//! The scheduled event entity and its lifecycle.
//!
//! A [`ScheduledEvent`] is the single central entity of the orchestrator: a
//! delivery unit created `PENDING`, claimed `PROCESSING` under a worker
//! lease, and finished `COMPLETED`, `DEAD_LETTER` or `CANCELLED`. A
//! retriable delivery failure returns the event to `PENDING`; a transient
//! `FAILED` state is never persisted.
//!
//! The store is the owner of the canonical row; workers only ever hold a
//! lease (`locked_by` + `lock_expires_at`). The transition helpers on this
//! type keep the row invariants in one place:
//!
//! 1. `PROCESSING` iff `locked_by` and `lock_expires_at` are set
//! 2. terminal statuses carry `executed_at` and no lease
//! 3. `retry_count <= max_retries + 1`

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::id::EventId;

/// Maximum stored length of `last_error`, in characters.
pub const MAX_ERROR_LEN: usize = 4000;

/// How an event is delivered to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryType {
    /// POST the payload to an HTTP(S) URL.
    Http,
    /// Produce the payload to a Kafka topic.
    Kafka,
}

impl DeliveryType {
    /// Returns the canonical wire/storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Kafka => "KAFKA",
        }
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "HTTP" => Ok(Self::Http),
            "KAFKA" => Ok(Self::Kafka),
            other => Err(Error::invalid_input(format!(
                "unknown delivery type '{other}' (expected HTTP or KAFKA)"
            ))),
        }
    }
}

/// Lifecycle status of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Waiting for its scheduled time; eligible for claiming once due.
    Pending,
    /// Claimed by a worker under a lease.
    Processing,
    /// Delivered successfully.
    Completed,
    /// Exhausted retries or failed non-retriably.
    DeadLetter,
    /// Cancelled by the caller before delivery.
    Cancelled,
}

impl EventStatus {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::DeadLetter => "DEAD_LETTER",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns true for statuses that end the lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter | Self::Cancelled)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "DEAD_LETTER" => Ok(Self::DeadLetter),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(Error::invalid_input(format!(
                "unknown event status '{other}'"
            ))),
        }
    }
}

/// A scheduled delivery unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Stable identifier, assigned at insert.
    pub id: EventId,
    /// Caller-supplied job identifier.
    pub external_job_id: String,
    /// Caller-supplied origin tag.
    pub source: String,
    /// Instant at which delivery becomes eligible. Immutable post-insert.
    pub scheduled_at: DateTime<Utc>,
    /// Delivery channel.
    pub delivery_type: DeliveryType,
    /// URL (HTTP) or topic name (KAFKA).
    pub destination: String,
    /// Opaque JSON text delivered as-is.
    pub payload: String,
    /// Current lifecycle status.
    pub status: EventStatus,
    /// Delivery attempts made so far.
    pub retry_count: i32,
    /// Retry budget; a single post-exhaustion attempt drives `DEAD_LETTER`.
    pub max_retries: i32,
    /// Last delivery error, truncated to [`MAX_ERROR_LEN`].
    pub last_error: Option<String>,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set on terminal transition.
    pub executed_at: Option<DateTime<Utc>>,
    /// Worker identity holding the lease; set iff `PROCESSING`.
    pub locked_by: Option<String>,
    /// Lease deadline; set iff `PROCESSING`.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Table partition discriminator derived from `scheduled_at`.
    pub partition_key: i32,
}

impl ScheduledEvent {
    /// Derives the partition key for a scheduled time:
    /// `year * 1000 + day_of_year`, evaluated in UTC.
    #[must_use]
    pub fn partition_key_for(scheduled_at: DateTime<Utc>) -> i32 {
        scheduled_at.year() * 1000 + scheduled_at.ordinal() as i32
    }

    /// Returns true if another delivery attempt fits the retry budget.
    ///
    /// Evaluated before the attempt is recorded: a failure with
    /// `can_retry() == false` goes straight to `DEAD_LETTER`.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Claims the event under a worker lease.
    pub fn acquire_lease(&mut self, worker_id: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = EventStatus::Processing;
        self.locked_by = Some(worker_id.to_string());
        self.lock_expires_at = Some(expires_at);
        self.updated_at = now;
    }

    /// Returns the event to `PENDING` without recording an attempt.
    ///
    /// Used when a claim turns out to be premature (clock drift) and by
    /// lease recovery.
    pub fn release_lease(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Pending;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    /// Records a successful delivery.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Completed;
        self.executed_at = Some(now);
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    /// Records a retriable failure: the attempt counts, the lease clears,
    /// and the event returns to `PENDING` for a future poll tick.
    pub fn mark_retried(&mut self, error: &str, now: DateTime<Utc>) {
        self.last_error = Some(truncate_error(error));
        self.retry_count += 1;
        self.status = EventStatus::Pending;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    /// Records a terminal failure and parks the event in `DEAD_LETTER`.
    pub fn mark_dead_letter(&mut self, error: &str, now: DateTime<Utc>) {
        self.last_error = Some(truncate_error(error));
        self.retry_count += 1;
        self.status = EventStatus::DeadLetter;
        self.executed_at = Some(now);
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    /// Cancels the event. Only reachable from `PENDING`; the store
    /// enforces the precondition.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Cancelled;
        self.executed_at = Some(now);
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}
