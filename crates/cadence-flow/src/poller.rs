//! The lease poller: claim due events, dispatch deliveries.
//!
//! One periodic loop per process. Each tick claims up to `batch_size` due
//! events under a lease and spawns one delivery task per event; the tick
//! never waits for deliveries, so a slow destination cannot stall the
//! claim cadence. There is no coordinator: the skip-locked claim is the
//! only cross-process lock, and N pollers claim disjoint batches.
//!
//! A single event's failure never halts the loop: the delivery engine
//! classifies every channel failure into its result, and an outcome-write
//! failure is logged and left for lease recovery to requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use cadence_core::observability::event_span;
use cadence_core::ScheduledEvent;

use crate::delivery::DeliveryEngine;
use crate::error::Result;
use crate::metrics::{names as metric_names, TimingGuard};
use crate::outcome::OutcomeWriter;
use crate::store::EventStore;

/// Poller cadence and claim sizing.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Tick interval.
    pub poll_interval: Duration,
    /// Maximum events claimed per tick.
    pub batch_size: usize,
    /// Lease TTL granted on claim.
    pub lease_duration: chrono::Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            lease_duration: chrono::Duration::minutes(5),
        }
    }
}

/// Generates the process-stable worker identity:
/// `hostname + "-" + 8-char random suffix`.
#[must_use]
pub fn worker_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{host}-{suffix}")
}

/// Periodic claim-and-dispatch loop.
pub struct EventPoller {
    store: Arc<dyn EventStore>,
    delivery: Arc<DeliveryEngine>,
    outcomes: Arc<OutcomeWriter>,
    worker_id: String,
    config: PollerConfig,
}

impl EventPoller {
    /// Creates a poller with a fresh worker identity.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        delivery: Arc<DeliveryEngine>,
        outcomes: Arc<OutcomeWriter>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            outcomes,
            worker_id: worker_identity(),
            config,
        }
    }

    /// The identity under which this poller claims leases.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs the poll loop until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(worker_id = %self.worker_id, "poller shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "poll tick failed; skipping this tick");
                    }
                }
            }
        }
    }

    /// One claim-and-dispatch pass. Returns the number of claimed events.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim itself fails; dispatched deliveries
    /// handle their own failures.
    pub async fn tick(&self) -> Result<usize> {
        let _timing = TimingGuard::new(|duration| {
            histogram!(metric_names::POLL_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
        });

        let now = Utc::now();
        let events = self
            .store
            .claim_due(
                &self.worker_id,
                now,
                now + self.config.lease_duration,
                self.config.batch_size,
            )
            .await?;

        if events.is_empty() {
            return Ok(0);
        }

        let claimed = events.len();
        counter!(metric_names::EVENTS_CLAIMED_TOTAL).increment(claimed as u64);
        debug!(worker_id = %self.worker_id, claimed, "claimed events for delivery");

        for event in events {
            // An edge-case claim can retrieve a not-yet-due event under
            // clock drift; hand it back rather than delivering early.
            if event.scheduled_at > now {
                if let Err(e) = self
                    .store
                    .reschedule_unclaim(event.id, &self.worker_id, now)
                    .await
                {
                    warn!(event_id = %event.id, error = %e, "failed to unclaim premature event");
                }
                continue;
            }

            let span = event_span("deliver", &event.id.to_string(), &event.external_job_id);
            let delivery = Arc::clone(&self.delivery);
            let outcomes = Arc::clone(&self.outcomes);
            let worker_id = self.worker_id.clone();
            tokio::spawn(
                async move {
                    process_event(&delivery, &outcomes, &worker_id, event).await;
                }
                .instrument(span),
            );
        }

        Ok(claimed)
    }
}

/// Delivers one claimed event and records its outcome. Captures every
/// failure: nothing propagates to the poll loop.
async fn process_event(
    delivery: &DeliveryEngine,
    outcomes: &OutcomeWriter,
    worker_id: &str,
    event: ScheduledEvent,
) {
    let result = delivery.deliver(&event).await;

    if let Err(e) = outcomes.apply(&event, worker_id, &result).await {
        error!(
            event_id = %event.id,
            error = %e,
            "failed to record delivery outcome; lease recovery will requeue"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::delivery::HttpDeliveryConfig;
    use crate::store::memory::InMemoryEventStore;
    use crate::store::NewEvent;
    use cadence_core::{DeliveryType, EventStatus};
    use chrono::Duration as ChronoDuration;

    fn poller(
        store: &InMemoryEventStore,
        broker: &InMemoryBroker,
        batch_size: usize,
    ) -> Arc<EventPoller> {
        let store: Arc<dyn EventStore> = Arc::new(store.clone());
        let delivery = Arc::new(
            DeliveryEngine::new(HttpDeliveryConfig::default(), Arc::new(broker.clone())).unwrap(),
        );
        let outcomes = Arc::new(OutcomeWriter::new(Arc::clone(&store)));
        Arc::new(EventPoller::new(
            store,
            delivery,
            outcomes,
            PollerConfig {
                poll_interval: std::time::Duration::from_millis(10),
                batch_size,
                lease_duration: ChronoDuration::minutes(5),
            },
        ))
    }

    fn kafka_event(job: &str, offset: ChronoDuration) -> NewEvent {
        NewEvent {
            external_job_id: job.into(),
            source: "billing".into(),
            scheduled_at: Utc::now() + offset,
            delivery_type: DeliveryType::Kafka,
            destination: "downstream.topic".into(),
            payload: "{}".into(),
            max_retries: 3,
        }
    }

    async fn wait_for_terminal(store: &InMemoryEventStore, job: &str) -> EventStatus {
        for _ in 0..100 {
            let event = store.get_by_external_job_id(job).await.unwrap().unwrap();
            if event.status.is_terminal() {
                return event.status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("event {job} never reached a terminal status");
    }

    #[test]
    fn worker_identity_has_hostname_and_suffix() {
        let id = worker_identity();
        let (host, suffix) = id.rsplit_once('-').unwrap();
        assert!(!host.is_empty());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(char::is_alphanumeric));

        // Identities are per-process-instance unique.
        assert_ne!(worker_identity(), worker_identity());
    }

    #[tokio::test]
    async fn tick_claims_and_delivers_due_events() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        store.insert(kafka_event("job-1", ChronoDuration::seconds(-5))).await.unwrap();

        let poller = poller(&store, &broker, 10);
        let claimed = poller.tick().await.unwrap();
        assert_eq!(claimed, 1);

        assert_eq!(wait_for_terminal(&store, "job-1").await, EventStatus::Completed);
        assert_eq!(broker.produced("downstream.topic").len(), 1);
    }

    #[tokio::test]
    async fn tick_skips_events_not_yet_due() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        store.insert(kafka_event("future", ChronoDuration::hours(1))).await.unwrap();

        let poller = poller(&store, &broker, 10);
        assert_eq!(poller.tick().await.unwrap(), 0);
        assert!(broker.produced("downstream.topic").is_empty());
    }

    #[tokio::test]
    async fn two_pollers_claim_disjoint_batches() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        for i in 0..20 {
            store
                .insert(kafka_event(&format!("job-{i}"), ChronoDuration::seconds(-5)))
                .await
                .unwrap();
        }

        let a = poller(&store, &broker, 10);
        let b = poller(&store, &broker, 10);
        let (claimed_a, claimed_b) = tokio::join!(a.tick(), b.tick());
        assert_eq!(claimed_a.unwrap() + claimed_b.unwrap(), 20);

        for i in 0..20 {
            let job = format!("job-{i}");
            assert_eq!(wait_for_terminal(&store, &job).await, EventStatus::Completed);
        }
        // Every event delivered exactly once across both workers.
        assert_eq!(broker.produced("downstream.topic").len(), 20);
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancellation() {
        let store = InMemoryEventStore::new();
        let broker = InMemoryBroker::new();
        let poller = poller(&store, &broker, 10);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&poller).run(shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("poller should stop promptly")
            .unwrap();
    }
}
