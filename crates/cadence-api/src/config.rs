//! Server configuration.
//!
//! Environment-driven configuration for the `cadenced` binary. Every knob
//! has a production default; only the database URL and Kafka bootstrap
//! servers are required. A value that is present but unparsable is a
//! fatal startup error.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use cron::Schedule;

use cadence_flow::error::{Error, Result};

/// Configuration for the cadence server.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,
    /// Emit JSON logs instead of pretty logs.
    pub log_json: bool,

    /// Postgres connection URL.
    pub database_url: String,
    /// Connection pool size. Sized to cover a full claim batch completing
    /// concurrently plus the maintenance loops and admin traffic.
    pub database_pool_size: u32,

    /// Kafka connection and topics.
    pub kafka: KafkaConfig,
    /// Poller and lease settings.
    pub scheduler: SchedulerConfig,
    /// Ingestion pipeline settings.
    pub ingestion: IngestionConfig,
    /// Delivery HTTP client settings.
    pub delivery: DeliveryConfig,
    /// Retention settings.
    pub cleanup: CleanupConfig,

    /// Bearer token required by the admin cleanup endpoint.
    pub admin_token: Option<String>,
}

/// Kafka connection and topic settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub bootstrap_servers: String,
    /// Ingestion buffer topic.
    pub ingestion_topic: String,
    /// Ingestion dead-letter topic.
    pub dlq_topic: String,
    /// Persister consumer group.
    pub group_id: String,
    /// Ingestion topic partition count (used when provisioning topics).
    pub partitions: u32,
    /// Replication factor for provisioned topics.
    pub replication_factor: u32,
}

/// Poller and lease settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll tick interval.
    pub poll_interval: Duration,
    /// Maximum events claimed per tick.
    pub batch_size: usize,
    /// Lease TTL granted on claim.
    pub lease_duration: chrono::Duration,
    /// Interval between stale-lease recovery passes.
    pub recovery_interval: Duration,
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Number of persister consumer tasks.
    pub consumer_concurrency: usize,
    /// Tier-1 dedup LRU capacity.
    pub dedup_lru_size: usize,
    /// Retry budget applied when a request omits `max_retries`.
    pub max_retries_default: i32,
}

/// Delivery HTTP client settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// TCP connect timeout.
    pub http_connect_timeout: Duration,
    /// Full-request timeout.
    pub http_read_timeout: Duration,
}

/// Retention settings.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Retention window in days.
    pub retention_days: u32,
    /// Rows deleted per batch.
    pub batch_size: usize,
    /// Cron expression for the cleanup schedule.
    pub cron_expression: String,
    /// Timezone the cron expression is evaluated in.
    pub timezone: Tz,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_json: false,
            database_url: String::new(),
            database_pool_size: 50,
            kafka: KafkaConfig {
                bootstrap_servers: String::new(),
                ingestion_topic: "cadence.events.ingest".to_string(),
                dlq_topic: "cadence.events.dlq".to_string(),
                group_id: "cadence-persister".to_string(),
                partitions: 24,
                replication_factor: 3,
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(1000),
                batch_size: 100,
                lease_duration: chrono::Duration::minutes(5),
                recovery_interval: Duration::from_secs(60),
            },
            ingestion: IngestionConfig {
                consumer_concurrency: 10,
                dedup_lru_size: 100_000,
                max_retries_default: 3,
            },
            delivery: DeliveryConfig {
                http_connect_timeout: Duration::from_millis(5000),
                http_read_timeout: Duration::from_millis(30_000),
            },
            cleanup: CleanupConfig {
                retention_days: 7,
                batch_size: 10_000,
                cron_expression: "0 0 2 * * *".to_string(),
                timezone: chrono_tz::UTC,
            },
            admin_token: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `CADENCE_HTTP_PORT`
    /// - `CADENCE_LOG_FORMAT` (`json` | `pretty`)
    /// - `CADENCE_DATABASE_URL` (required)
    /// - `CADENCE_DATABASE_POOL_SIZE`
    /// - `CADENCE_KAFKA_BOOTSTRAP_SERVERS` (required)
    /// - `CADENCE_KAFKA_INGESTION_TOPIC`
    /// - `CADENCE_KAFKA_DLQ_TOPIC`
    /// - `CADENCE_KAFKA_GROUP_ID`
    /// - `CADENCE_INGESTION_PARTITIONS`
    /// - `CADENCE_KAFKA_REPLICATION_FACTOR`
    /// - `CADENCE_POLL_INTERVAL_MS`
    /// - `CADENCE_BATCH_SIZE`
    /// - `CADENCE_LEASE_DURATION_MIN`
    /// - `CADENCE_RECOVERY_INTERVAL_MS`
    /// - `CADENCE_CONSUMER_CONCURRENCY`
    /// - `CADENCE_DEDUP_LRU_SIZE`
    /// - `CADENCE_MAX_RETRIES_DEFAULT`
    /// - `CADENCE_HTTP_CONNECT_TIMEOUT_MS`
    /// - `CADENCE_HTTP_READ_TIMEOUT_MS`
    /// - `CADENCE_RETENTION_DAYS`
    /// - `CADENCE_CLEANUP_BATCH_SIZE`
    /// - `CADENCE_CLEANUP_CRON`
    /// - `CADENCE_CLEANUP_TIMEZONE`
    /// - `CADENCE_ADMIN_TOKEN`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required variable is missing or
    /// any present variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("CADENCE_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(format) = env_string("CADENCE_LOG_FORMAT") {
            config.log_json = parse_log_format(&format)?;
        }

        config.database_url = require_env("CADENCE_DATABASE_URL")?;
        if let Some(size) = env_u32("CADENCE_DATABASE_POOL_SIZE")? {
            config.database_pool_size = size;
        }

        config.kafka.bootstrap_servers = require_env("CADENCE_KAFKA_BOOTSTRAP_SERVERS")?;
        if let Some(topic) = env_string("CADENCE_KAFKA_INGESTION_TOPIC") {
            config.kafka.ingestion_topic = topic;
        }
        if let Some(topic) = env_string("CADENCE_KAFKA_DLQ_TOPIC") {
            config.kafka.dlq_topic = topic;
        }
        if let Some(group) = env_string("CADENCE_KAFKA_GROUP_ID") {
            config.kafka.group_id = group;
        }
        if let Some(partitions) = env_u32("CADENCE_INGESTION_PARTITIONS")? {
            config.kafka.partitions = partitions;
        }
        if let Some(replication) = env_u32("CADENCE_KAFKA_REPLICATION_FACTOR")? {
            config.kafka.replication_factor = replication;
        }

        if let Some(ms) = env_u64("CADENCE_POLL_INTERVAL_MS")? {
            config.scheduler.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_usize("CADENCE_BATCH_SIZE")? {
            config.scheduler.batch_size = size;
        }
        if let Some(minutes) = env_u64("CADENCE_LEASE_DURATION_MIN")? {
            config.scheduler.lease_duration =
                chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX));
        }
        if let Some(ms) = env_u64("CADENCE_RECOVERY_INTERVAL_MS")? {
            config.scheduler.recovery_interval = Duration::from_millis(ms);
        }

        if let Some(concurrency) = env_usize("CADENCE_CONSUMER_CONCURRENCY")? {
            config.ingestion.consumer_concurrency = concurrency;
        }
        if let Some(size) = env_usize("CADENCE_DEDUP_LRU_SIZE")? {
            config.ingestion.dedup_lru_size = size;
        }
        if let Some(retries) = env_u32("CADENCE_MAX_RETRIES_DEFAULT")? {
            config.ingestion.max_retries_default = i32::try_from(retries).unwrap_or(i32::MAX);
        }

        if let Some(ms) = env_u64("CADENCE_HTTP_CONNECT_TIMEOUT_MS")? {
            config.delivery.http_connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CADENCE_HTTP_READ_TIMEOUT_MS")? {
            config.delivery.http_read_timeout = Duration::from_millis(ms);
        }

        if let Some(days) = env_u32("CADENCE_RETENTION_DAYS")? {
            config.cleanup.retention_days = days;
        }
        if let Some(size) = env_usize("CADENCE_CLEANUP_BATCH_SIZE")? {
            config.cleanup.batch_size = size;
        }
        if let Some(cron) = env_string("CADENCE_CLEANUP_CRON") {
            config.cleanup.cron_expression = cron;
        }
        if let Some(timezone) = env_string("CADENCE_CLEANUP_TIMEZONE") {
            config.cleanup.timezone = timezone.parse().map_err(|_| {
                Error::configuration(format!(
                    "CADENCE_CLEANUP_TIMEZONE must be an IANA timezone (got {timezone})"
                ))
            })?;
        }

        config.admin_token = env_string("CADENCE_ADMIN_TOKEN");

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !(0..=10).contains(&self.ingestion.max_retries_default) {
            return Err(Error::configuration(
                "CADENCE_MAX_RETRIES_DEFAULT must be between 0 and 10",
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(Error::configuration("CADENCE_BATCH_SIZE must be positive"));
        }
        if self.cleanup.batch_size == 0 {
            return Err(Error::configuration(
                "CADENCE_CLEANUP_BATCH_SIZE must be positive",
            ));
        }
        if self.ingestion.consumer_concurrency == 0 {
            return Err(Error::configuration(
                "CADENCE_CONSUMER_CONCURRENCY must be positive",
            ));
        }
        if self.database_pool_size == 0 {
            return Err(Error::configuration(
                "CADENCE_DATABASE_POOL_SIZE must be positive",
            ));
        }
        Schedule::from_str(&self.cleanup.cron_expression).map_err(|e| {
            Error::configuration(format!(
                "CADENCE_CLEANUP_CRON is not a valid cron expression: {e}"
            ))
        })?;
        Ok(())
    }
}

fn parse_log_format(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "json" => Ok(true),
        "pretty" => Ok(false),
        other => Err(Error::configuration(format!(
            "CADENCE_LOG_FORMAT must be 'json' or 'pretty' (got {other})"
        ))),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn require_env(name: &str) -> Result<String> {
    env_string(name).ok_or_else(|| Error::configuration(format!("missing {name}")))
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u16: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
}
