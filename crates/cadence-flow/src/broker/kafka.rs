//! Kafka broker implementation.
//!
//! Producer settings follow the durability contract of the ingestion
//! buffer: all in-sync replicas acknowledge, idempotent produce, batched
//! with a short linger window, lz4-compressed. Consumers commit offsets
//! manually; an acknowledged batch commits the consumer position, an
//! unacknowledged one is redelivered after a rebalance or restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::{error, info, warn};

use super::{Broker, BrokerConsumer, ConsumedBatch, DlqMessage, EventMessage};
use crate::error::{Error, Result};

/// Connection and topic settings for the Kafka broker.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    /// Comma-separated bootstrap servers.
    pub bootstrap_servers: String,
    /// Ingestion buffer topic.
    pub ingestion_topic: String,
    /// Ingestion dead-letter topic.
    pub dlq_topic: String,
    /// Consumer group for the persister pool.
    pub group_id: String,
}

fn producer_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.bootstrap_servers)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.send.max.retries", "3")
        .set("linger.ms", "10")
        .set("compression.type", "lz4")
        .set("max.in.flight.requests.per.connection", "5");
    config
}

fn consumer_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.bootstrap_servers)
        .set("group.id", &settings.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("isolation.level", "read_committed")
        .set("fetch.wait.max.ms", "500");
    config
}

/// Kafka-backed [`Broker`].
///
/// One shared instance per process; the producer is thread-safe and each
/// persister task opens its own consumer via [`Broker::consumer`].
pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: Arc<FutureProducer>,
}

impl KafkaBroker {
    /// Connects the producer.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the client cannot be constructed; treat
    /// as a fatal startup failure.
    pub fn new(settings: KafkaSettings) -> Result<Self> {
        let producer: FutureProducer = producer_config(&settings)
            .create()
            .map_err(|e| Error::broker_with_source("failed to create Kafka producer", e))?;
        Ok(Self {
            settings,
            producer: Arc::new(producer),
        })
    }

    /// Creates the ingestion and DLQ topics if they do not exist.
    ///
    /// The ingestion topic gets the configured partition count and a
    /// seven-day retention; the DLQ gets half the partitions and thirty
    /// days. Existing topics are left untouched.
    ///
    /// # Errors
    ///
    /// Returns a broker error if topic creation fails for any reason
    /// other than the topic already existing.
    pub async fn ensure_topics(&self, partitions: i32, replication_factor: i32) -> Result<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .create()
            .map_err(|e| Error::broker_with_source("failed to create Kafka admin client", e))?;

        let partitions = partitions.max(1);
        let dlq_partitions = (partitions / 2).max(1);
        let min_insync = (replication_factor - 1).max(1).to_string();
        let ingestion_retention = (7 * 24 * 60 * 60 * 1000i64).to_string();
        let dlq_retention = (30 * 24 * 60 * 60 * 1000i64).to_string();

        let topics = [
            NewTopic::new(
                &self.settings.ingestion_topic,
                partitions,
                TopicReplication::Fixed(replication_factor),
            )
            .set("retention.ms", &ingestion_retention)
            .set("cleanup.policy", "delete")
            .set("min.insync.replicas", &min_insync),
            NewTopic::new(
                &self.settings.dlq_topic,
                dlq_partitions,
                TopicReplication::Fixed(replication_factor),
            )
            .set("retention.ms", &dlq_retention),
        ];

        let results = admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .map_err(|e| Error::broker_with_source("topic creation failed", e))?;
        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "created Kafka topic"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => {
                    return Err(Error::broker(format!(
                        "failed to create topic '{topic}': {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(30)))
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::broker_with_source(format!("produce to '{topic}' failed"), e))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn produce(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.send(topic, key, payload).await
    }

    async fn produce_event(&self, message: &EventMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| Error::serialization(format!("event message encode failed: {e}")))?;
        self.send(
            &self.settings.ingestion_topic,
            &message.partition_key(),
            &payload,
        )
        .await
    }

    async fn produce_dlq(&self, message: &DlqMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| Error::serialization(format!("DLQ message encode failed: {e}")))?;
        self.send(
            &self.settings.dlq_topic,
            &message.original.partition_key(),
            &payload,
        )
        .await
    }

    fn consumer(&self) -> Result<Box<dyn BrokerConsumer>> {
        let consumer: StreamConsumer = consumer_config(&self.settings)
            .create()
            .map_err(|e| Error::broker_with_source("failed to create Kafka consumer", e))?;
        consumer
            .subscribe(&[self.settings.ingestion_topic.as_str()])
            .map_err(|e| Error::broker_with_source("failed to subscribe to ingestion topic", e))?;
        Ok(Box::new(KafkaConsumerHandle {
            consumer,
            producer: Arc::clone(&self.producer),
            dlq_topic: self.settings.dlq_topic.clone(),
        }))
    }
}

struct KafkaConsumerHandle {
    consumer: StreamConsumer,
    producer: Arc<FutureProducer>,
    dlq_topic: String,
}

impl KafkaConsumerHandle {
    /// Routes an undecodable record to the DLQ as-is; a payload that never
    /// parsed cannot be retried by the persister.
    async fn dlq_raw(&self, key: Option<&[u8]>, payload: &[u8]) {
        let key = key.map(|k| String::from_utf8_lossy(k).into_owned());
        let record = FutureRecord::to(&self.dlq_topic)
            .key(key.as_deref().unwrap_or(""))
            .payload(payload);
        if let Err((e, _)) = self
            .producer
            .send(record, Timeout::After(Duration::from_secs(30)))
            .await
        {
            error!(error = %e, "failed to DLQ undecodable ingestion record");
        }
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumerHandle {
    async fn poll_batch(&mut self, max_messages: usize, wait: Duration) -> Result<ConsumedBatch> {
        let mut messages = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;

        while messages.len() < max_messages {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let record = match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    return Err(Error::broker_with_source("ingestion consume failed", e));
                }
                Err(_) => break,
            };

            let Some(payload) = record.payload() else {
                warn!("ignoring ingestion record with empty payload");
                continue;
            };
            match serde_json::from_slice::<EventMessage>(payload) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(error = %e, "undecodable ingestion record, routing to DLQ");
                    self.dlq_raw(record.key(), payload).await;
                }
            }
        }

        Ok(ConsumedBatch { messages })
    }

    async fn ack(&mut self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| Error::broker_with_source("offset commit failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> KafkaSettings {
        KafkaSettings {
            bootstrap_servers: "localhost:9092".into(),
            ingestion_topic: "cadence.events.ingest".into(),
            dlq_topic: "cadence.events.dlq".into(),
            group_id: "cadence-persister".into(),
        }
    }

    #[test]
    fn producer_config_is_durable_and_idempotent() {
        let config = producer_config(&settings());
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("linger.ms"), Some("10"));
        assert_eq!(config.get("compression.type"), Some("lz4"));
    }

    #[test]
    fn consumer_config_commits_manually() {
        let config = consumer_config(&settings());
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("isolation.level"), Some("read_committed"));
        assert_eq!(config.get("group.id"), Some("cadence-persister"));
    }
}
