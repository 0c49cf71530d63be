//! The persister: ingestion buffer to event store.
//!
//! Consumes the buffer in batches and lands every message in exactly one
//! terminal ingestion outcome: persisted, suppressed as a duplicate, or
//! parked on the DLQ. Each message is persisted in its own atomic unit so
//! one bad message cannot roll back its batch-mates.
//!
//! The batch is acknowledged only once every message has an outcome. If a
//! DLQ produce fails there is nowhere safe to record the message, so the
//! ack is withheld and the buffer redelivers the batch; already-persisted
//! messages are absorbed by the dedup tiers on redelivery.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{Broker, DlqMessage, EventMessage};
use crate::dedup::{Deduplicator, DuplicateTier};
use crate::error::Result;
use crate::metrics::{labels as metric_labels, names as metric_names, TimingGuard};
use crate::store::{EventStore, InsertOutcome, NewEvent};

/// Persister sizing.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Number of independent consumer tasks.
    pub concurrency: usize,
    /// Maximum messages per consumed batch.
    pub batch_size: usize,
    /// How long a poll waits for the first message.
    pub poll_wait: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 500,
            poll_wait: Duration::from_millis(500),
        }
    }
}

impl From<&EventMessage> for NewEvent {
    fn from(message: &EventMessage) -> Self {
        Self {
            external_job_id: message.external_job_id.clone(),
            source: message.source.clone(),
            scheduled_at: message.scheduled_at,
            delivery_type: message.delivery_type,
            destination: message.destination.clone(),
            payload: message.payload.clone(),
            max_retries: message.max_retries,
        }
    }
}

/// Buffer-to-store consumer pool.
pub struct Persister {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    dedup: Arc<Deduplicator>,
    config: PersisterConfig,
}

impl Persister {
    /// Creates a persister over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        dedup: Arc<Deduplicator>,
        config: PersisterConfig,
    ) -> Self {
        Self {
            store,
            broker,
            dedup,
            config,
        }
    }

    /// Runs the consumer pool until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut handles = Vec::with_capacity(self.config.concurrency);
        for slot in 0..self.config.concurrency {
            let persister = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                persister.run_consumer(slot, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_consumer(&self, slot: usize, shutdown: CancellationToken) {
        let mut consumer = match self.broker.consumer() {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(slot, error = %e, "failed to open ingestion consumer");
                return;
            }
        };

        loop {
            let batch = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(slot, "persister consumer shutting down");
                    return;
                }
                batch = consumer.poll_batch(self.config.batch_size, self.config.poll_wait) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(slot, error = %e, "ingestion poll failed; retrying");
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            match self.process_batch(&batch.messages).await {
                Ok(()) => {
                    if let Err(e) = consumer.ack().await {
                        warn!(slot, error = %e, "batch ack failed; batch will be redelivered");
                    }
                }
                Err(e) => {
                    // No ack: the buffer redelivers and the dedup tiers
                    // absorb whatever already landed.
                    warn!(slot, error = %e, "batch left unacknowledged");
                }
            }
        }
    }

    /// Lands every message in a terminal ingestion outcome.
    ///
    /// # Errors
    ///
    /// Returns an error when the batch must not be acknowledged: a
    /// transient store failure during the dedup check, or a DLQ produce
    /// failure.
    pub async fn process_batch(&self, messages: &[EventMessage]) -> Result<()> {
        let _timing = TimingGuard::new(|duration| {
            histogram!(metric_names::PERSIST_BATCH_DURATION_SECONDS)
                .record(duration.as_secs_f64());
        });
        debug!(batch = messages.len(), "processing ingestion batch");

        for message in messages {
            self.process_message(message).await?;
        }
        Ok(())
    }

    async fn process_message(&self, message: &EventMessage) -> Result<()> {
        if let Some(tier) = self
            .dedup
            .check(
                self.store.as_ref(),
                message.message_id,
                &message.external_job_id,
                &message.source,
                message.scheduled_at,
            )
            .await?
        {
            let tier = match tier {
                DuplicateTier::Lru => "lru",
                DuplicateTier::Store => "store",
            };
            counter!(
                metric_names::EVENTS_DUPLICATE_TOTAL,
                metric_labels::TIER => tier,
            )
            .increment(1);
            debug!(message_id = %message.message_id, tier, "duplicate submission suppressed");
            return Ok(());
        }

        match self.store.insert(NewEvent::from(message)).await {
            Ok(InsertOutcome::Inserted(id)) => {
                self.dedup.record(message.message_id);
                counter!(metric_names::EVENTS_PERSISTED_TOTAL).increment(1);
                debug!(message_id = %message.message_id, event_id = %id, "event persisted");
            }
            Ok(InsertOutcome::Duplicate) => {
                // A concurrent process won the race past both tiers; the
                // constraint is the backstop and this is a suppression.
                counter!(
                    metric_names::EVENTS_DUPLICATE_TOTAL,
                    metric_labels::TIER => "constraint",
                )
                .increment(1);
                debug!(message_id = %message.message_id, "duplicate suppressed by unique constraint");
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    external_job_id = %message.external_job_id,
                    error = %e,
                    "failed to persist event; routing to DLQ"
                );
                let dlq = DlqMessage::new(message.clone(), format!("persist failed: {e}"));
                self.broker.produce_dlq(&dlq).await?;
                counter!(metric_names::DLQ_MESSAGES_TOTAL).increment(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::store::memory::InMemoryEventStore;
    use crate::store::{CancelOutcome, StatusCounts, UpdateOutcome};
    use async_trait::async_trait;
    use cadence_core::{DeliveryType, EventId, MessageId, ScheduledEvent};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn message(job: &str, scheduled_at: DateTime<Utc>) -> EventMessage {
        EventMessage {
            message_id: MessageId::generate(),
            external_job_id: job.into(),
            source: "billing".into(),
            scheduled_at,
            delivery_type: DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: "{}".into(),
            max_retries: 3,
            received_at: Utc::now(),
        }
    }

    fn persister(store: Arc<dyn EventStore>, broker: &InMemoryBroker) -> Persister {
        Persister::new(
            store,
            Arc::new(broker.clone()),
            Arc::new(Deduplicator::new(1024)),
            PersisterConfig::default(),
        )
    }

    /// Delegating store that fails inserts for a marker job ID, for
    /// exercising the DLQ path.
    struct FailingInsertStore {
        inner: InMemoryEventStore,
        poison: String,
    }

    #[async_trait]
    impl EventStore for FailingInsertStore {
        async fn insert(&self, event: NewEvent) -> Result<InsertOutcome> {
            if event.external_job_id == self.poison {
                return Err(crate::error::Error::storage("partition missing"));
            }
            self.inner.insert(event).await
        }

        async fn exists_by_dedup_key(
            &self,
            external_job_id: &str,
            source: &str,
            scheduled_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner
                .exists_by_dedup_key(external_job_id, source, scheduled_at)
                .await
        }

        async fn claim_due(
            &self,
            worker_id: &str,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<ScheduledEvent>> {
            self.inner.claim_due(worker_id, now, lease_until, limit).await
        }

        async fn complete(
            &self,
            id: EventId,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> Result<UpdateOutcome> {
            self.inner.complete(id, worker_id, now).await
        }

        async fn fail_retriable(
            &self,
            id: EventId,
            worker_id: &str,
            error: &str,
            now: DateTime<Utc>,
        ) -> Result<UpdateOutcome> {
            self.inner.fail_retriable(id, worker_id, error, now).await
        }

        async fn fail_terminal(
            &self,
            id: EventId,
            worker_id: &str,
            error: &str,
            now: DateTime<Utc>,
        ) -> Result<UpdateOutcome> {
            self.inner.fail_terminal(id, worker_id, error, now).await
        }

        async fn reschedule_unclaim(
            &self,
            id: EventId,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> Result<UpdateOutcome> {
            self.inner.reschedule_unclaim(id, worker_id, now).await
        }

        async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.release_expired(now).await
        }

        async fn delete_terminal_batch(
            &self,
            cutoff: DateTime<Utc>,
            batch_size: usize,
        ) -> Result<u64> {
            self.inner.delete_terminal_batch(cutoff, batch_size).await
        }

        async fn get_by_id(&self, id: EventId) -> Result<Option<ScheduledEvent>> {
            self.inner.get_by_id(id).await
        }

        async fn get_by_external_job_id(
            &self,
            external_job_id: &str,
        ) -> Result<Option<ScheduledEvent>> {
            self.inner.get_by_external_job_id(external_job_id).await
        }

        async fn list_by_external_job_id(
            &self,
            external_job_id: &str,
        ) -> Result<Vec<ScheduledEvent>> {
            self.inner.list_by_external_job_id(external_job_id).await
        }

        async fn cancel_by_id(&self, id: EventId, now: DateTime<Utc>) -> Result<CancelOutcome> {
            self.inner.cancel_by_id(id, now).await
        }

        async fn cancel_by_external_job_id(
            &self,
            external_job_id: &str,
            now: DateTime<Utc>,
        ) -> Result<u64> {
            self.inner.cancel_by_external_job_id(external_job_id, now).await
        }

        async fn status_counts(&self) -> Result<StatusCounts> {
            self.inner.status_counts().await
        }
    }

    #[tokio::test]
    async fn persists_each_message_once() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        let persister = persister(Arc::new(store.clone()), &broker);

        let at = Utc::now() + ChronoDuration::hours(1);
        let original = message("job-1", at);
        let mut redelivered = original.clone();
        redelivered.message_id = MessageId::generate();

        persister
            .process_batch(&[original.clone(), original, redelivered, message("job-2", at)])
            .await
            .unwrap();

        // Same message ID, same dedup key, and a fresh message ID with the
        // same dedup key all collapse into one row.
        assert_eq!(store.len().await, 2);
        assert!(broker.dlq_messages().is_empty());
    }

    #[tokio::test]
    async fn insert_failure_routes_to_dlq_without_poisoning_the_batch() {
        let broker = InMemoryBroker::new();
        let inner = InMemoryEventStore::new();
        let store = Arc::new(FailingInsertStore {
            inner: inner.clone(),
            poison: "bad-job".into(),
        });
        let persister = persister(store, &broker);

        let at = Utc::now() + ChronoDuration::hours(1);
        persister
            .process_batch(&[message("good-1", at), message("bad-job", at), message("good-2", at)])
            .await
            .unwrap();

        assert_eq!(inner.len().await, 2);
        let dlq = broker.dlq_messages();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].original.external_job_id, "bad-job");
        assert!(dlq[0].error.contains("persist failed"));
    }

    #[tokio::test]
    async fn dlq_failure_withholds_the_ack() {
        let broker = InMemoryBroker::new();
        broker.fail_dlq_produces(true);
        let inner = InMemoryEventStore::new();
        let store = Arc::new(FailingInsertStore {
            inner,
            poison: "bad-job".into(),
        });
        let persister = persister(store, &broker);

        let at = Utc::now() + ChronoDuration::hours(1);
        let result = persister.process_batch(&[message("bad-job", at)]).await;
        assert!(result.is_err(), "DLQ failure must abort the batch ack");
    }

    #[tokio::test]
    async fn consumer_loop_drains_the_buffer_and_acks() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        let at = Utc::now() + ChronoDuration::hours(1);
        for i in 0..5 {
            broker.produce_event(&message(&format!("job-{i}"), at)).await.unwrap();
        }

        let persister = Arc::new(Persister::new(
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            Arc::new(Deduplicator::new(1024)),
            PersisterConfig {
                concurrency: 2,
                batch_size: 3,
                poll_wait: Duration::from_millis(10),
            },
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&persister).run(shutdown.clone()));

        for _ in 0..100 {
            if store.len().await == 5 && broker.ingestion_depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.len().await, 5);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("persister should stop promptly")
            .unwrap();
    }
}
