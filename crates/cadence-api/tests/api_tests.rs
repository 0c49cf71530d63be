//! API surface tests over an in-memory wired application: validation,
//! lookup, cancellation, statistics and admin auth.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use cadence_core::EventStatus;
use cadence_flow::admin::AdminService;
use cadence_flow::broker::memory::InMemoryBroker;
use cadence_flow::retention::{RetentionConfig, RetentionLoop};
use cadence_flow::store::memory::InMemoryEventStore;
use cadence_flow::store::{EventStore, NewEvent};

use cadence_api::server::{build_router, AppState};

struct TestApp {
    router: Router,
    store: InMemoryEventStore,
    broker: InMemoryBroker,
}

fn app_with_token(admin_token: Option<&str>) -> TestApp {
    let store = InMemoryEventStore::new();
    let broker = InMemoryBroker::new();
    let store_dyn: Arc<dyn EventStore> = Arc::new(store.clone());
    let retention = Arc::new(
        RetentionLoop::new(Arc::clone(&store_dyn), RetentionConfig::default()).unwrap(),
    );
    let state = AppState {
        broker: Arc::new(broker.clone()),
        admin: Arc::new(AdminService::new(store_dyn, retention)),
        max_retries_default: 3,
        retention_days_default: 7,
        admin_token: admin_token.map(str::to_string),
        metrics: None,
    };
    TestApp {
        router: build_router(state),
        store,
        broker,
    }
}

fn app() -> TestApp {
    app_with_token(None)
}

fn submission(job: &str) -> Value {
    json!({
        "external_job_id": job,
        "source": "billing",
        "scheduled_at": (Utc::now() + Duration::hours(1)).to_rfc3339(),
        "delivery_type": "HTTP",
        "destination": "https://example.com/hook",
        "payload": {"order": 42},
        "max_retries": 2
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn insert_pending(app: &TestApp, job: &str, offset: Duration) -> cadence_core::EventId {
    match app
        .store
        .insert(NewEvent {
            external_job_id: job.into(),
            source: "billing".into(),
            scheduled_at: Utc::now() + offset,
            delivery_type: cadence_core::DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: "{}".into(),
            max_retries: 3,
        })
        .await
        .unwrap()
    {
        cadence_flow::store::InsertOutcome::Inserted(id) => id,
        cadence_flow::store::InsertOutcome::Duplicate => unreachable!(),
    }
}

#[tokio::test]
async fn submit_accepts_and_enqueues() {
    let app = app();
    let (status, body) = send(&app.router, post_json("/api/v1/events", &submission("job-1"))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "Event queued for processing");
    assert!(body["message_id"].as_str().unwrap().parse::<uuid::Uuid>().is_ok());
    assert_eq!(app.broker.ingestion_depth(), 1);
}

#[tokio::test]
async fn submit_rejects_past_schedule() {
    let app = app();
    let mut body = submission("job-1");
    body["scheduled_at"] = json!((Utc::now() - Duration::hours(1)).to_rfc3339());

    let (status, body) = send(&app.router, post_json("/api/v1/events", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["message"].as_str().unwrap().contains("future"));
    assert_eq!(app.broker.ingestion_depth(), 0);
}

#[tokio::test]
async fn submit_rejects_bad_destinations() {
    let app = app();

    let mut body = submission("job-1");
    body["destination"] = json!("ftp://example.com");
    let (status, _) = send(&app.router, post_json("/api/v1/events", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut body = submission("job-2");
    body["delivery_type"] = json!("KAFKA");
    body["destination"] = json!("orders topic");
    let (status, response) = send(&app.router, post_json("/api/v1/events", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["message"].as_str().unwrap().contains("spaces"));
}

#[tokio::test]
async fn batch_reports_per_event_outcomes() {
    let app = app();
    let mut bad = submission("bad-job");
    bad["max_retries"] = json!(99);

    let batch = json!({ "events": [submission("ok-1"), bad, submission("ok-2")] });
    let (status, body) = send(&app.router, post_json("/api/v1/events/batch", &batch)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["total_submitted"], 3);
    assert_eq!(body["total_accepted"], 2);
    assert_eq!(body["total_rejected"], 1);
    assert_eq!(body["rejected_events"][0]["index"], 1);
    assert_eq!(body["rejected_events"][0]["external_job_id"], "bad-job");
    assert_eq!(app.broker.ingestion_depth(), 2);
}

#[tokio::test]
async fn batch_enforces_the_size_cap() {
    let app = app();
    let events: Vec<Value> = (0..1001).map(|i| submission(&format!("job-{i}"))).collect();
    let (status, body) = send(
        &app.router,
        post_json("/api/v1/events/batch", &json!({ "events": events })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("1000"));

    let (status, _) = send(
        &app.router,
        post_json("/api/v1/events/batch", &json!({ "events": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lookup_by_id_and_external_job_id() {
    let app = app();
    let id = insert_pending(&app, "job-1", Duration::hours(1)).await;

    let (status, body) = send(&app.router, get(&format!("/api/v1/events/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["external_job_id"], "job-1");
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["payload"], json!({}));

    let (status, _) = send(&app.router, get("/api/v1/events/external/job-1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app.router, get("/api/v1/events/external/job-1/all")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn lookup_misses_are_distinguished_from_bad_ids() {
    let app = app();

    let (status, body) = send(&app.router, get("/api/v1/events/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let missing = uuid::Uuid::new_v4();
    let (status, body) = send(&app.router, get(&format!("/api/v1/events/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&app.router, get("/api/v1/events/external/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_pending_succeeds_and_processing_conflicts() {
    let app = app();
    let pending = insert_pending(&app, "pending-job", Duration::hours(1)).await;
    let due = insert_pending(&app, "due-job", Duration::seconds(-5)).await;

    let now = Utc::now();
    app.store
        .claim_due("worker-a", now, now + Duration::minutes(5), 1)
        .await
        .unwrap();

    let (status, body) = send(&app.router, delete(&format!("/api/v1/events/{pending}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], 1);
    let stored = app.store.get_by_id(pending).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Cancelled);

    let (status, body) = send(&app.router, delete(&format!("/api/v1/events/{due}"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE");

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app.router, delete(&format!("/api/v1/events/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bulk_cancel_by_external_job_id() {
    let app = app();
    insert_pending(&app, "job-1", Duration::hours(1)).await;
    // Second row for the same job at a different time.
    app.store
        .insert(NewEvent {
            external_job_id: "job-1".into(),
            source: "billing".into(),
            scheduled_at: Utc::now() + Duration::hours(2),
            delivery_type: cadence_core::DeliveryType::Http,
            destination: "https://example.com/hook".into(),
            payload: "{}".into(),
            max_retries: 3,
        })
        .await
        .unwrap();

    let (status, body) = send(&app.router, delete("/api/v1/events/external/job-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], 2);

    // Nothing left to cancel.
    let (status, _) = send(&app.router, delete("/api/v1/events/external/job-1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn statistics_reports_counts_by_status() {
    let app = app();
    insert_pending(&app, "a", Duration::hours(1)).await;
    insert_pending(&app, "b", Duration::seconds(-5)).await;
    let now = Utc::now();
    app.store
        .claim_due("worker-a", now, now + Duration::minutes(5), 1)
        .await
        .unwrap();

    let (status, body) = send(&app.router, get("/api/v1/events/statistics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["processing"], 1);
    assert_eq!(body["total"], 2);
}

#[tokio::test]
async fn admin_cleanup_requires_the_bearer_token() {
    let app = app_with_token(Some("s3cret"));

    let (status, _) = send(
        &app.router,
        post_json("/api/v1/events/admin/cleanup?days=3", &Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authed = Request::builder()
        .method("POST")
        .uri("/api/v1/events/admin/cleanup?days=3")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, authed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);
    assert!(body["cutoff"].is_string());
}

#[tokio::test]
async fn admin_cleanup_is_disabled_without_a_configured_token() {
    let app = app();
    let authed = Request::builder()
        .method("POST")
        .uri("/api/v1/events/admin/cleanup")
        .header(header::AUTHORIZATION, "Bearer anything")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, authed).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].as_str().unwrap().contains("CADENCE_ADMIN_TOKEN"));
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = app();
    let (status, body) = send(&app.router, get("/api/v1/events/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");

    let (status, _) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}
