//! In-memory event store for tests.
//!
//! Implements the full [`EventStore`] contract over a `RwLock<HashMap>`,
//! including the dedup-key backstop and disjoint claims: a claim call
//! mutates under the write lock, so concurrent claimers can never receive
//! overlapping batches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use cadence_core::{EventId, EventStatus, ScheduledEvent};

use super::{CancelOutcome, EventStore, InsertOutcome, NewEvent, StatusCounts, UpdateOutcome};
use crate::error::Result;

/// In-memory [`EventStore`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<HashMap<EventId, ScheduledEvent>>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns true if the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

fn matches_dedup_key(event: &ScheduledEvent, new: &NewEvent) -> bool {
    event.external_job_id == new.external_job_id
        && event.source == new.source
        && event.scheduled_at == new.scheduled_at
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, new: NewEvent) -> Result<InsertOutcome> {
        let mut events = self.events.write().await;
        if events.values().any(|e| matches_dedup_key(e, &new)) {
            return Ok(InsertOutcome::Duplicate);
        }

        let now = Utc::now();
        let id = EventId::generate();
        let event = ScheduledEvent {
            id,
            external_job_id: new.external_job_id,
            source: new.source,
            scheduled_at: new.scheduled_at,
            delivery_type: new.delivery_type,
            destination: new.destination,
            payload: new.payload,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
            locked_by: None,
            lock_expires_at: None,
            partition_key: ScheduledEvent::partition_key_for(new.scheduled_at),
        };
        events.insert(id, event);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn exists_by_dedup_key(
        &self,
        external_job_id: &str,
        source: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let events = self.events.read().await;
        Ok(events.values().any(|e| {
            e.external_job_id == external_job_id
                && e.source == source
                && e.scheduled_at == scheduled_at
        }))
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEvent>> {
        let mut events = self.events.write().await;

        let mut due: Vec<EventId> = events
            .values()
            .filter(|e| {
                e.status == EventStatus::Pending
                    && e.scheduled_at <= now
                    && e.lock_expires_at.is_none_or(|expires| expires < now)
            })
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| events[id].scheduled_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(event) = events.get_mut(&id) {
                event.acquire_lease(worker_id, lease_until, now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if event.status != EventStatus::Processing || event.locked_by.as_deref() != Some(worker_id)
        {
            return Ok(UpdateOutcome::LeaseLost);
        }
        event.mark_completed(now);
        Ok(UpdateOutcome::Applied)
    }

    async fn fail_retriable(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if event.status != EventStatus::Processing || event.locked_by.as_deref() != Some(worker_id)
        {
            return Ok(UpdateOutcome::LeaseLost);
        }
        event.mark_retried(error, now);
        Ok(UpdateOutcome::Applied)
    }

    async fn fail_terminal(
        &self,
        id: EventId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if event.status != EventStatus::Processing || event.locked_by.as_deref() != Some(worker_id)
        {
            return Ok(UpdateOutcome::LeaseLost);
        }
        event.mark_dead_letter(error, now);
        Ok(UpdateOutcome::Applied)
    }

    async fn reschedule_unclaim(
        &self,
        id: EventId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if event.status != EventStatus::Processing || event.locked_by.as_deref() != Some(worker_id)
        {
            return Ok(UpdateOutcome::LeaseLost);
        }
        event.release_lease(now);
        Ok(UpdateOutcome::Applied)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write().await;
        let mut released = 0;
        for event in events.values_mut() {
            if event.status == EventStatus::Processing
                && event.lock_expires_at.is_some_and(|expires| expires < now)
            {
                event.release_lease(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn delete_terminal_batch(&self, cutoff: DateTime<Utc>, batch_size: usize) -> Result<u64> {
        let mut events = self.events.write().await;
        let doomed: Vec<EventId> = events
            .values()
            .filter(|e| {
                e.status.is_terminal() && e.executed_at.is_some_and(|executed| executed < cutoff)
            })
            .map(|e| e.id)
            .take(batch_size)
            .collect();
        for id in &doomed {
            events.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn get_by_id(&self, id: EventId) -> Result<Option<ScheduledEvent>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn get_by_external_job_id(
        &self,
        external_job_id: &str,
    ) -> Result<Option<ScheduledEvent>> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| e.external_job_id == external_job_id)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn list_by_external_job_id(&self, external_job_id: &str) -> Result<Vec<ScheduledEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<ScheduledEvent> = events
            .values()
            .filter(|e| e.external_job_id == external_job_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        Ok(matching)
    }

    async fn cancel_by_id(&self, id: EventId, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut events = self.events.write().await;
        let Some(event) = events.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if event.status != EventStatus::Pending {
            return Ok(CancelOutcome::InvalidState(event.status));
        }
        event.mark_cancelled(now);
        Ok(CancelOutcome::Cancelled)
    }

    async fn cancel_by_external_job_id(
        &self,
        external_job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut events = self.events.write().await;
        let mut cancelled = 0;
        for event in events.values_mut() {
            if event.external_job_id == external_job_id && event.status == EventStatus::Pending {
                event.mark_cancelled(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let events = self.events.read().await;
        let mut counts = StatusCounts::default();
        for event in events.values() {
            counts.record(event.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::DeliveryType;
    use chrono::Duration;

    fn new_event(job: &str, scheduled_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            external_job_id: job.into(),
            source: "billing".into(),
            scheduled_at,
            delivery_type: DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: r#"{"k":"v"}"#.into(),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn insert_suppresses_dedup_key_collision() {
        let store = InMemoryEventStore::new();
        let at = Utc::now();
        assert!(store.insert(new_event("job-1", at)).await.unwrap().is_inserted());
        assert_eq!(
            store.insert(new_event("job-1", at)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn claim_orders_by_scheduled_at_and_respects_limit() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("late", now - Duration::seconds(1))).await.unwrap();
        store.insert(new_event("early", now - Duration::seconds(30))).await.unwrap();
        store.insert(new_event("future", now + Duration::hours(1))).await.unwrap();

        let claimed = store
            .claim_due("worker-a", now, now + Duration::minutes(5), 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].external_job_id, "early");
        assert_eq!(claimed[0].status, EventStatus::Processing);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        for i in 0..10 {
            store
                .insert(new_event(&format!("job-{i}"), now - Duration::seconds(10)))
                .await
                .unwrap();
        }

        let a = store.claim_due("worker-a", now, now + Duration::minutes(5), 6).await.unwrap();
        let b = store.claim_due("worker-b", now, now + Duration::minutes(5), 6).await.unwrap();

        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 4);
        for claimed in &b {
            assert!(a.iter().all(|e| e.id != claimed.id));
        }
    }

    #[tokio::test]
    async fn outcome_writes_require_the_lease() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("job-1", now - Duration::seconds(1))).await.unwrap();
        let claimed = store
            .claim_due("worker-a", now, now + Duration::minutes(5), 10)
            .await
            .unwrap();
        let id = claimed[0].id;

        assert_eq!(
            store.complete(id, "worker-b", now).await.unwrap(),
            UpdateOutcome::LeaseLost
        );
        assert_eq!(store.complete(id, "worker-a", now).await.unwrap(), UpdateOutcome::Applied);
        // COMPLETED is terminal; a late writer cannot re-enter it.
        assert_eq!(
            store.complete(id, "worker-a", now).await.unwrap(),
            UpdateOutcome::LeaseLost
        );
    }

    #[tokio::test]
    async fn release_expired_returns_rows_to_pending() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("job-1", now - Duration::seconds(1))).await.unwrap();
        store
            .claim_due("worker-a", now, now + Duration::minutes(5), 10)
            .await
            .unwrap();

        assert_eq!(store.release_expired(now).await.unwrap(), 0);

        let later = now + Duration::minutes(6);
        assert_eq!(store.release_expired(later).await.unwrap(), 1);
        let event = store.get_by_external_job_id("job-1").await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert!(event.locked_by.is_none());
    }

    #[tokio::test]
    async fn delete_terminal_batch_spares_live_rows() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("done", now - Duration::days(10))).await.unwrap();
        store.insert(new_event("live", now - Duration::days(10))).await.unwrap();

        let claimed = store
            .claim_due("worker-a", now, now + Duration::minutes(5), 1)
            .await
            .unwrap();
        store.complete(claimed[0].id, "worker-a", now - Duration::days(9)).await.unwrap();

        let cutoff = now - Duration::days(7);
        assert_eq!(store.delete_terminal_batch(cutoff, 100).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);

        // Remaining row is the non-terminal one.
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn cancel_requires_pending() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("job-1", now - Duration::seconds(1))).await.unwrap();
        let id = match store.insert(new_event("job-2", now + Duration::hours(1))).await.unwrap() {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => unreachable!(),
        };

        let claimed = store
            .claim_due("worker-a", now, now + Duration::minutes(5), 1)
            .await
            .unwrap();
        assert!(matches!(
            store.cancel_by_id(claimed[0].id, now).await.unwrap(),
            CancelOutcome::InvalidState(EventStatus::Processing)
        ));

        assert_eq!(store.cancel_by_id(id, now).await.unwrap(), CancelOutcome::Cancelled);
        let event = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Cancelled);
        assert!(event.executed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_by_external_job_id_is_bulk() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("job-1", now + Duration::hours(1))).await.unwrap();
        store.insert(new_event("job-1", now + Duration::hours(2))).await.unwrap();
        store.insert(new_event("other", now + Duration::hours(1))).await.unwrap();

        assert_eq!(store.cancel_by_external_job_id("job-1", now).await.unwrap(), 2);
        assert_eq!(store.cancel_by_external_job_id("job-1", now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_by_external_job_id_prefers_most_recent() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert(new_event("job-1", now + Duration::hours(1))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.insert(new_event("job-1", now + Duration::hours(2))).await.unwrap();

        let latest = store.get_by_external_job_id("job-1").await.unwrap().unwrap();
        assert_eq!(latest.scheduled_at, now + Duration::hours(2));
        assert_eq!(store.list_by_external_job_id("job-1").await.unwrap().len(), 2);
    }
}
