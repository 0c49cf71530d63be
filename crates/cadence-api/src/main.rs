//! `cadenced` binary entrypoint.
//!
//! Loads configuration from environment variables, connects the store and
//! broker, spawns the pipeline loops and serves the HTTP API. Any startup
//! failure (missing config, unreachable store) aborts with a non-zero
//! exit code before the process accepts traffic.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use cadence_api::config::Config;
use cadence_api::server::{build_router, AppState};
use cadence_core::observability::{init_logging, LogFormat};
use cadence_flow::admin::AdminService;
use cadence_flow::broker::kafka::{KafkaBroker, KafkaSettings};
use cadence_flow::broker::Broker;
use cadence_flow::dedup::Deduplicator;
use cadence_flow::delivery::{DeliveryEngine, HttpDeliveryConfig};
use cadence_flow::outcome::OutcomeWriter;
use cadence_flow::persister::{Persister, PersisterConfig};
use cadence_flow::poller::{EventPoller, PollerConfig};
use cadence_flow::recovery::RecoveryLoop;
use cadence_flow::retention::{RetentionConfig, RetentionLoop};
use cadence_flow::store::postgres::PostgresEventStore;
use cadence_flow::store::EventStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("configuration")?;

    init_logging(if config.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    // Store: unreachable-at-boot is a fatal startup failure.
    let pool = PgPoolOptions::new()
        .max_connections(config.database_pool_size)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the event store")?;
    let postgres = PostgresEventStore::new(pool);
    postgres.migrate().await.context("schema migration")?;
    postgres
        .ensure_partitions(Utc::now())
        .await
        .context("partition pre-creation")?;
    let store: Arc<dyn EventStore> = Arc::new(postgres);

    let kafka = KafkaBroker::new(KafkaSettings {
        bootstrap_servers: config.kafka.bootstrap_servers.clone(),
        ingestion_topic: config.kafka.ingestion_topic.clone(),
        dlq_topic: config.kafka.dlq_topic.clone(),
        group_id: config.kafka.group_id.clone(),
    })
    .context("failed to connect to the ingestion buffer")?;
    kafka
        .ensure_topics(
            i32::try_from(config.kafka.partitions).unwrap_or(24),
            i32::try_from(config.kafka.replication_factor).unwrap_or(3),
        )
        .await
        .context("topic provisioning")?;
    let broker: Arc<dyn Broker> = Arc::new(kafka);

    // Pipeline components.
    let dedup = Arc::new(Deduplicator::new(config.ingestion.dedup_lru_size));
    let delivery = Arc::new(
        DeliveryEngine::new(
            HttpDeliveryConfig {
                connect_timeout: config.delivery.http_connect_timeout,
                read_timeout: config.delivery.http_read_timeout,
            },
            Arc::clone(&broker),
        )
        .context("failed to build the delivery engine")?,
    );
    let outcomes = Arc::new(OutcomeWriter::new(Arc::clone(&store)));
    let poller = Arc::new(EventPoller::new(
        Arc::clone(&store),
        delivery,
        outcomes,
        PollerConfig {
            poll_interval: config.scheduler.poll_interval,
            batch_size: config.scheduler.batch_size,
            lease_duration: config.scheduler.lease_duration,
        },
    ));
    let persister = Arc::new(Persister::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        dedup,
        PersisterConfig {
            concurrency: config.ingestion.consumer_concurrency,
            ..PersisterConfig::default()
        },
    ));
    let recovery = Arc::new(RecoveryLoop::new(
        Arc::clone(&store),
        config.scheduler.recovery_interval,
    ));
    let retention = Arc::new(
        RetentionLoop::new(
            Arc::clone(&store),
            RetentionConfig {
                cron_expression: config.cleanup.cron_expression.clone(),
                timezone: config.cleanup.timezone,
                retention_days: config.cleanup.retention_days,
                batch_size: config.cleanup.batch_size,
            },
        )
        .context("retention schedule")?,
    );
    let admin = Arc::new(AdminService::new(Arc::clone(&store), Arc::clone(&retention)));

    tracing::info!(
        worker_id = %poller.worker_id(),
        http_port = config.http_port,
        "cadence starting"
    );

    // Background loops, all tied to one shutdown token.
    let shutdown = CancellationToken::new();
    let loops = vec![
        tokio::spawn(Arc::clone(&poller).run(shutdown.clone())),
        tokio::spawn(Arc::clone(&persister).run(shutdown.clone())),
        tokio::spawn(Arc::clone(&recovery).run(shutdown.clone())),
        tokio::spawn(Arc::clone(&retention).run(shutdown.clone())),
    ];

    let state = AppState {
        broker,
        admin,
        max_retries_default: config.ingestion.max_retries_default,
        retention_days_default: config.cleanup.retention_days,
        admin_token: config.admin_token.clone(),
        metrics: Some(metrics_handle),
    };
    let router = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "HTTP server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // The signal handler already cancelled the token; wait for the loops
    // to drain in-flight work.
    for handle in loops {
        let _ = handle.await;
    }
    tracing::info!("cadence stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
