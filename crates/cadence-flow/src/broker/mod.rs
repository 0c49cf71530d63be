//! Ingestion buffer and delivery-topic abstraction.
//!
//! This module provides:
//!
//! - [`Broker`]: trait for producing keyed records and opening consumers
//! - [`BrokerConsumer`]: at-least-once batch consumption with explicit acks
//! - [`EventMessage`]: the serializable ingestion envelope
//! - [`memory::InMemoryBroker`]: in-memory implementation for tests
//! - [`kafka::KafkaBroker`]: Kafka implementation for production
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: the persister and delivery engine see the same
//!   interface for Kafka and the in-memory test broker
//! - **Per-key ordering**: records produced with the same key land on the
//!   same partition; the ingestion key is `source + ":" + external_job_id`
//! - **Explicit acks**: a consumed batch is redelivered until acknowledged

pub mod kafka;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{DeliveryType, MessageId};

use crate::error::Result;

/// Envelope for a submission travelling through the ingestion buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique message ID for idempotency tracking.
    pub message_id: MessageId,
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
    /// When the submission was accepted by the API.
    pub received_at: DateTime<Utc>,
}

impl EventMessage {
    /// Returns the buffer partition key: all submissions for a given
    /// `(source, external_job_id)` pair land on the same partition.
    #[must_use]
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.source, self.external_job_id)
    }
}

/// A message parked on the ingestion dead-letter topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    /// The message that could not be persisted.
    pub original: EventMessage,
    /// Why it was parked.
    pub error: String,
    /// When it was parked.
    pub failed_at: DateTime<Utc>,
}

impl DlqMessage {
    /// Wraps a failed message with its error.
    #[must_use]
    pub fn new(original: EventMessage, error: impl Into<String>) -> Self {
        Self {
            original,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// A batch of messages consumed from the ingestion buffer.
///
/// The batch is redelivered unless [`BrokerConsumer::ack`] is called
/// after every message has reached a terminal outcome.
#[derive(Debug, Default)]
pub struct ConsumedBatch {
    /// Messages in buffer order (per partition).
    pub messages: Vec<EventMessage>,
}

impl ConsumedBatch {
    /// Returns true if the batch holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A single consumer handle onto the ingestion buffer.
///
/// Each persister task owns one consumer; the backing consumer group
/// balances partitions across handles and processes.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Polls for the next batch, waiting up to `wait` for the first
    /// message. Returns an empty batch on timeout.
    ///
    /// An unacknowledged previous batch is redelivered first.
    async fn poll_batch(&mut self, max_messages: usize, wait: Duration) -> Result<ConsumedBatch>;

    /// Acknowledges the most recently polled batch.
    async fn ack(&mut self) -> Result<()>;
}

/// Broker abstraction for the ingestion buffer and external delivery
/// topics.
///
/// A single shared instance per process; all methods are `&self` and
/// thread-safe.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Produces a raw keyed record to an arbitrary topic. Used by the
    /// delivery engine for `KAFKA` destinations.
    async fn produce(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;

    /// Produces an event message to the ingestion topic, keyed by
    /// [`EventMessage::partition_key`].
    async fn produce_event(&self, message: &EventMessage) -> Result<()>;

    /// Produces a failed message to the ingestion DLQ topic.
    async fn produce_dlq(&self, message: &DlqMessage) -> Result<()>;

    /// Opens a new consumer onto the ingestion topic.
    fn consumer(&self) -> Result<Box<dyn BrokerConsumer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(source: &str, job: &str) -> EventMessage {
        EventMessage {
            message_id: MessageId::generate(),
            external_job_id: job.into(),
            source: source.into(),
            scheduled_at: Utc::now(),
            delivery_type: DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: "{}".into(),
            max_retries: 3,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn partition_key_joins_source_and_job() {
        assert_eq!(message("billing", "job-7").partition_key(), "billing:job-7");
    }

    #[test]
    fn event_message_round_trips_through_json() {
        let msg = message("billing", "job-7");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: EventMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_id, msg.message_id);
        assert_eq!(parsed.delivery_type, DeliveryType::Http);
    }

    #[test]
    fn dlq_message_carries_the_error() {
        let dlq = DlqMessage::new(message("billing", "job-7"), "persist failed: boom");
        assert!(dlq.error.contains("boom"));
        assert_eq!(dlq.original.external_job_id, "job-7");
    }
}
