//! Delivery channels and failure classification.
//!
//! The delivery engine performs exactly one attempt per invocation and
//! maps the result to a [`DeliveryResult`]; re-attempts happen through the
//! outcome writer returning the event to `PENDING` and a future poll tick
//! claiming it again.
//!
//! Classification:
//!
//! - **HTTP success**: any 2xx
//! - **HTTP retriable**: status in {408, 429, 500, 502, 503, 504}, or a
//!   transport error (connect refused, timeouts, DNS, TLS)
//! - **HTTP terminal**: any other status, or a malformed destination URL
//! - **Kafka**: any produce failure is retriable
//!
//! Nothing here returns an error to the poll loop: channel failures are
//! values carried in the result.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use reqwest::StatusCode;
use tracing::{debug, warn};

use cadence_core::{DeliveryType, ScheduledEvent};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::metrics::{labels as metric_labels, names as metric_names, TimingGuard};

/// HTTP statuses worth another attempt.
const RETRIABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The destination accepted the event.
    Success,
    /// The attempt failed.
    Failure {
        /// Error description, recorded as the event's `last_error`.
        error: String,
        /// Whether the event should return to `PENDING` for another
        /// attempt (subject to the retry budget).
        retriable: bool,
    },
}

impl DeliveryResult {
    /// A failed attempt.
    #[must_use]
    pub fn failure(error: impl Into<String>, retriable: bool) -> Self {
        Self::Failure {
            error: error.into(),
            retriable,
        }
    }

    /// Returns true for a successful attempt.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn result_label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { retriable: true, .. } => "retriable",
            Self::Failure {
                retriable: false, ..
            } => "terminal",
        }
    }
}

/// HTTP channel timeouts.
#[derive(Debug, Clone)]
pub struct HttpDeliveryConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Full-request (read) timeout.
    pub read_timeout: Duration,
}

impl Default for HttpDeliveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Dispatches claimed events to their destinations.
pub struct DeliveryEngine {
    http: reqwest::Client,
    broker: Arc<dyn Broker>,
}

impl DeliveryEngine {
    /// Builds the engine and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns a delivery error if the HTTP client cannot be constructed.
    pub fn new(config: HttpDeliveryConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| Error::delivery(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, broker })
    }

    /// Performs one delivery attempt. Never returns an error; every
    /// failure mode is classified into the result.
    pub async fn deliver(&self, event: &ScheduledEvent) -> DeliveryResult {
        let channel = match event.delivery_type {
            DeliveryType::Http => "http",
            DeliveryType::Kafka => "kafka",
        };
        let _timing = TimingGuard::new(|duration| {
            histogram!(
                metric_names::DELIVERY_DURATION_SECONDS,
                metric_labels::CHANNEL => channel,
            )
            .record(duration.as_secs_f64());
        });

        let result = match event.delivery_type {
            DeliveryType::Http => self.deliver_http(event).await,
            DeliveryType::Kafka => self.deliver_kafka(event).await,
        };

        counter!(
            metric_names::DELIVERIES_TOTAL,
            metric_labels::CHANNEL => channel,
            metric_labels::RESULT => result.result_label(),
        )
        .increment(1);

        result
    }

    async fn deliver_http(&self, event: &ScheduledEvent) -> DeliveryResult {
        let url = match reqwest::Url::parse(&event.destination) {
            Ok(url) => url,
            Err(e) => {
                return DeliveryResult::failure(
                    format!("malformed destination URL: {e}"),
                    false,
                );
            }
        };

        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(event.payload.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!(event_id = %event.id, status = %response.status(), "HTTP delivery successful");
                DeliveryResult::Success
            }
            Ok(response) => {
                let status = response.status();
                let error = format_status_error(status);
                let retriable = is_retriable_status(status.as_u16());
                warn!(event_id = %event.id, retriable, error = %error, "HTTP delivery failed");
                DeliveryResult::failure(error, retriable)
            }
            Err(e) => {
                // Connect refusals, timeouts, DNS and TLS failures all
                // surface here; the URL parsed, so the request is sound
                // and worth retrying.
                warn!(event_id = %event.id, error = %e, "HTTP delivery transport error");
                DeliveryResult::failure(e.to_string(), true)
            }
        }
    }

    async fn deliver_kafka(&self, event: &ScheduledEvent) -> DeliveryResult {
        match self
            .broker
            .produce(
                &event.destination,
                &event.external_job_id,
                event.payload.as_bytes(),
            )
            .await
        {
            Ok(()) => {
                debug!(event_id = %event.id, topic = %event.destination, "Kafka delivery successful");
                DeliveryResult::Success
            }
            Err(e) => {
                let error = format!("Kafka delivery failed: {e}");
                warn!(event_id = %event.id, error = %error, "Kafka delivery failed");
                DeliveryResult::failure(error, true)
            }
        }
    }
}

/// Returns true for HTTP statuses that warrant another attempt.
#[must_use]
pub fn is_retriable_status(status: u16) -> bool {
    RETRIABLE_STATUS_CODES.contains(&status)
}

fn format_status_error(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP {}: {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use cadence_core::{EventId, EventStatus};
    use chrono::Utc;

    fn event(delivery_type: DeliveryType, destination: &str) -> ScheduledEvent {
        let now = Utc::now();
        ScheduledEvent {
            id: EventId::generate(),
            external_job_id: "job-1".into(),
            source: "billing".into(),
            scheduled_at: now,
            delivery_type,
            destination: destination.into(),
            payload: r#"{"k":"v"}"#.into(),
            status: EventStatus::Processing,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
            locked_by: Some("worker-a".into()),
            lock_expires_at: Some(now + chrono::Duration::minutes(5)),
            partition_key: ScheduledEvent::partition_key_for(now),
        }
    }

    fn engine(broker: &InMemoryBroker) -> DeliveryEngine {
        DeliveryEngine::new(HttpDeliveryConfig::default(), Arc::new(broker.clone())).unwrap()
    }

    #[test]
    fn retriable_status_table() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retriable_status(status), "{status} should be retriable");
        }
        for status in [400, 401, 403, 404, 410, 422, 501] {
            assert!(!is_retriable_status(status), "{status} should be terminal");
        }
    }

    #[test]
    fn status_errors_are_formatted_for_operators() {
        assert_eq!(
            format_status_error(StatusCode::SERVICE_UNAVAILABLE),
            "HTTP 503: Service Unavailable"
        );
    }

    #[tokio::test]
    async fn malformed_url_is_terminal() {
        let broker = InMemoryBroker::new();
        let result = engine(&broker)
            .deliver(&event(DeliveryType::Http, "not a url"))
            .await;
        assert!(matches!(
            &result,
            DeliveryResult::Failure { retriable: false, error }
                if error.contains("malformed destination URL")
        ));
    }

    #[tokio::test]
    async fn kafka_delivery_produces_keyed_payload() {
        let broker = InMemoryBroker::new();
        let result = engine(&broker)
            .deliver(&event(DeliveryType::Kafka, "downstream.topic"))
            .await;
        assert!(result.is_success());

        let records = broker.produced("downstream.topic");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "job-1");
        assert_eq!(records[0].1, br#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn kafka_produce_failure_is_retriable() {
        let broker = InMemoryBroker::new();
        broker.fail_produces(true);
        let result = engine(&broker)
            .deliver(&event(DeliveryType::Kafka, "downstream.topic"))
            .await;
        assert!(matches!(
            &result,
            DeliveryResult::Failure { retriable: true, error }
                if error.contains("Kafka delivery failed")
        ));
    }
}
