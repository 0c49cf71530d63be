//! In-memory broker for tests.
//!
//! Preserves the contract the persister relies on: per-key FIFO ordering,
//! at-least-once delivery with explicit acks (an unacked batch is
//! redelivered on the next poll), and inspectable produced records for
//! asserting deliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Broker, BrokerConsumer, ConsumedBatch, DlqMessage, EventMessage};
use crate::error::{Error, Result};

#[derive(Default)]
struct Shared {
    ingestion: Mutex<VecDeque<EventMessage>>,
    dlq: Mutex<Vec<DlqMessage>>,
    produced: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    fail_dlq: AtomicBool,
    fail_produce: AtomicBool,
}

/// In-memory [`Broker`] implementation.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns records produced to `topic` as `(key, payload)` pairs.
    #[must_use]
    pub fn produced(&self, topic: &str) -> Vec<(String, Vec<u8>)> {
        self.shared
            .produced
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the parked DLQ messages.
    #[must_use]
    pub fn dlq_messages(&self) -> Vec<DlqMessage> {
        self.shared.dlq.lock().clone()
    }

    /// Returns the number of messages waiting on the ingestion topic.
    #[must_use]
    pub fn ingestion_depth(&self) -> usize {
        self.shared.ingestion.lock().len()
    }

    /// Makes subsequent DLQ produces fail, for exercising the
    /// no-ack-on-DLQ-failure path.
    pub fn fail_dlq_produces(&self, fail: bool) {
        self.shared.fail_dlq.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent raw produces fail, for exercising retriable
    /// delivery failures.
    pub fn fail_produces(&self, fail: bool) {
        self.shared.fail_produce.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn produce(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        if self.shared.fail_produce.load(Ordering::SeqCst) {
            return Err(Error::broker(format!("produce to '{topic}' failed")));
        }
        self.shared
            .produced
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((key.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn produce_event(&self, message: &EventMessage) -> Result<()> {
        self.shared.ingestion.lock().push_back(message.clone());
        Ok(())
    }

    async fn produce_dlq(&self, message: &DlqMessage) -> Result<()> {
        if self.shared.fail_dlq.load(Ordering::SeqCst) {
            return Err(Error::broker("DLQ produce failed"));
        }
        self.shared.dlq.lock().push(message.clone());
        Ok(())
    }

    fn consumer(&self) -> Result<Box<dyn BrokerConsumer>> {
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            in_flight: Vec::new(),
        }))
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    in_flight: Vec<EventMessage>,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll_batch(&mut self, max_messages: usize, _wait: Duration) -> Result<ConsumedBatch> {
        // Redeliver an unacked batch before handing out new messages.
        if !self.in_flight.is_empty() {
            return Ok(ConsumedBatch {
                messages: self.in_flight.clone(),
            });
        }

        let mut ingestion = self.shared.ingestion.lock();
        let take = max_messages.min(ingestion.len());
        self.in_flight = ingestion.drain(..take).collect();
        Ok(ConsumedBatch {
            messages: self.in_flight.clone(),
        })
    }

    async fn ack(&mut self) -> Result<()> {
        self.in_flight.clear();
        Ok(())
    }
}
