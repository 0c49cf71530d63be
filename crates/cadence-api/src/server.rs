//! HTTP server wiring.
//!
//! [`AppState`] holds the collaborators the route handlers need; the
//! router mounts the event API under `/api/v1/events` plus the liveness
//! and metrics endpoints. Background loops are spawned by the binary, not
//! here: the server owns request handling only.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use cadence_flow::admin::AdminService;
use cadence_flow::broker::Broker;

use crate::routes::events;

/// Shared state for the route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broker for enqueueing submissions.
    pub broker: Arc<dyn Broker>,
    /// Lookup/cancel/statistics service.
    pub admin: Arc<AdminService>,
    /// Retry budget applied when a request omits `max_retries`.
    pub max_retries_default: i32,
    /// Retention window applied when the cleanup endpoint omits `days`.
    pub retention_days_default: u32,
    /// Bearer token for admin endpoints; `None` disables them.
    pub admin_token: Option<String>,
    /// Prometheus registry handle for the metrics endpoint.
    pub metrics: Option<PrometheusHandle>,
}

/// Builds the application router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let events_api = Router::new()
        .route("/", post(events::submit_event))
        .route("/batch", post(events::submit_events_batch))
        .route("/statistics", get(events::statistics))
        .route("/health", get(events::health))
        .route("/admin/cleanup", post(events::manual_cleanup))
        .route(
            "/external/{external_job_id}",
            get(events::get_event_by_external_job_id)
                .delete(events::cancel_events_by_external_job_id),
        )
        .route(
            "/external/{external_job_id}/all",
            get(events::list_events_by_external_job_id),
        )
        .route(
            "/{id}",
            get(events::get_event_by_id).delete(events::cancel_event_by_id),
        );

    Router::new()
        .nest("/api/v1/events", events_api)
        .route("/health", get(events::health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_flow::retention::{RetentionConfig, RetentionLoop};
    use cadence_flow::store::memory::InMemoryEventStore;
    use cadence_flow::store::EventStore;

    #[test]
    fn router_builds_with_in_memory_state() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let retention =
            Arc::new(RetentionLoop::new(Arc::clone(&store), RetentionConfig::default()).unwrap());
        let state = AppState {
            broker: Arc::new(cadence_flow::broker::memory::InMemoryBroker::new()),
            admin: Arc::new(AdminService::new(store, retention)),
            max_retries_default: 3,
            retention_days_default: 7,
            admin_token: None,
            metrics: None,
        };
        let _router = build_router(state);
    }
}
