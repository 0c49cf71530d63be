//! Two-tier duplicate suppression for re-delivered submissions.
//!
//! Tier 1 is a bounded in-process LRU of recently-seen message IDs,
//! populated when a message is persisted. Tier 2 is the authoritative
//! dedup-key existence check against the store. Neither tier is the final
//! word: a race between two processes past Tier 2 is resolved by the
//! store's unique constraint at insert, which the persister treats as a
//! successful suppression.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use cadence_core::MessageId;

use crate::error::Result;
use crate::store::EventStore;

/// Default Tier-1 capacity.
pub const DEFAULT_LRU_CAPACITY: usize = 100_000;

/// Which tier suppressed a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateTier {
    /// Seen in the in-process LRU.
    Lru,
    /// Found by the store's dedup-key query.
    Store,
}

/// Two-tier duplicate filter.
pub struct Deduplicator {
    recent: Mutex<LruCache<MessageId, ()>>,
}

impl Deduplicator {
    /// Creates a deduplicator with the given Tier-1 capacity.
    ///
    /// A zero capacity falls back to [`DEFAULT_LRU_CAPACITY`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_LRU_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Checks both tiers for a duplicate of the given submission.
    ///
    /// Tier 1 is consulted first; on a miss, the store is asked whether a
    /// row with the dedup key `(external_job_id, source, scheduled_at)`
    /// already exists.
    pub async fn check(
        &self,
        store: &dyn EventStore,
        message_id: MessageId,
        external_job_id: &str,
        source: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<DuplicateTier>> {
        if self.recent.lock().get(&message_id).is_some() {
            return Ok(Some(DuplicateTier::Lru));
        }
        if store
            .exists_by_dedup_key(external_job_id, source, scheduled_at)
            .await?
        {
            return Ok(Some(DuplicateTier::Store));
        }
        Ok(None)
    }

    /// Records a message ID after its row reached the store.
    pub fn record(&self, message_id: MessageId) {
        self.recent.lock().put(message_id, ());
    }

    /// Current Tier-1 occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    /// Returns true if Tier 1 is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryEventStore;
    use crate::store::NewEvent;
    use cadence_core::DeliveryType;

    fn new_event(job: &str, scheduled_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            external_job_id: job.into(),
            source: "billing".into(),
            scheduled_at,
            delivery_type: DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: "{}".into(),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn tier1_catches_recent_message_ids() {
        let store = InMemoryEventStore::new();
        let dedup = Deduplicator::new(16);
        let id = MessageId::generate();
        let at = Utc::now();

        assert_eq!(dedup.check(&store, id, "job-1", "billing", at).await.unwrap(), None);
        dedup.record(id);
        assert_eq!(
            dedup.check(&store, id, "job-1", "billing", at).await.unwrap(),
            Some(DuplicateTier::Lru)
        );
    }

    #[tokio::test]
    async fn tier2_consults_the_store() {
        let store = InMemoryEventStore::new();
        let dedup = Deduplicator::new(16);
        let at = Utc::now();
        store.insert(new_event("job-1", at)).await.unwrap();

        // Fresh message ID, but the dedup key already has a row.
        let id = MessageId::generate();
        assert_eq!(
            dedup.check(&store, id, "job-1", "billing", at).await.unwrap(),
            Some(DuplicateTier::Store)
        );

        // Different scheduled time: a distinct submission.
        let later = at + chrono::Duration::hours(1);
        assert_eq!(dedup.check(&store, id, "job-1", "billing", later).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lru_evicts_beyond_capacity() {
        let store = InMemoryEventStore::new();
        let dedup = Deduplicator::new(2);
        let at = Utc::now();

        let first = MessageId::generate();
        dedup.record(first);
        dedup.record(MessageId::generate());
        dedup.record(MessageId::generate());

        assert_eq!(dedup.len(), 2);
        // The oldest entry aged out; Tier 2 finds nothing for it either.
        assert_eq!(dedup.check(&store, first, "job-x", "billing", at).await.unwrap(), None);
    }

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let dedup = Deduplicator::new(0);
        assert!(dedup.is_empty());
    }
}
