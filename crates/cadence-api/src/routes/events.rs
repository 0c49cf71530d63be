//! Scheduled event API routes.
//!
//! ## Routes
//!
//! - `POST /api/v1/events` - submit a single event
//! - `POST /api/v1/events/batch` - submit up to 1000 events
//! - `GET /api/v1/events/{id}` - lookup by ID
//! - `GET /api/v1/events/external/{ext}` - most recent event for a job
//! - `GET /api/v1/events/external/{ext}/all` - all events for a job
//! - `DELETE /api/v1/events/{id}` - cancel by ID (PENDING only)
//! - `DELETE /api/v1/events/external/{ext}` - bulk cancel by job
//! - `GET /api/v1/events/statistics` - counts by status (admin)
//! - `POST /api/v1/events/admin/cleanup?days=N` - manual retention pass
//! - `GET /api/v1/events/health` - liveness probe
//!
//! Submission is accepted with `202`: the event is enqueued to the
//! ingestion buffer and persisted asynchronously, which is what absorbs
//! thundering-herd submission bursts.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cadence_core::{DeliveryType, EventId, MessageId, ScheduledEvent};
use cadence_flow::broker::EventMessage;
use cadence_flow::retention::CleanupResult;
use cadence_flow::store::{CancelOutcome, StatusCounts};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Maximum events per batch submission.
pub const MAX_BATCH_SIZE: usize = 1000;

// ============================================================================
// Request/Response types
// ============================================================================

/// Request body for event submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitEventRequest {
    /// Caller-supplied job identifier (1..=255 chars).
    pub external_job_id: String,
    /// Caller-supplied origin tag (1..=100 chars).
    pub source: String,
    /// Delivery-eligibility instant; must be in the future.
    pub scheduled_at: DateTime<Utc>,
    /// Delivery channel.
    pub delivery_type: DeliveryType,
    /// URL (HTTP) or topic name (KAFKA), 1..=2048 chars.
    pub destination: String,
    /// Arbitrary JSON payload, delivered as-is.
    pub payload: serde_json::Value,
    /// Retry budget (0..=10); defaults from configuration when omitted.
    pub max_retries: Option<i32>,
}

/// Response for a single accepted submission.
#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    /// Idempotency handle for the submission.
    pub message_id: MessageId,
    /// Human-readable acknowledgement.
    pub message: &'static str,
}

/// Request body for batch submission.
#[derive(Debug, Deserialize)]
pub struct BatchSubmitRequest {
    /// Events to submit, at most [`MAX_BATCH_SIZE`].
    pub events: Vec<SubmitEventRequest>,
}

/// A rejected entry in a batch submission.
#[derive(Debug, Serialize)]
pub struct RejectedEvent {
    /// Index of the event in the submitted batch.
    pub index: usize,
    /// The caller's job identifier, echoed back.
    pub external_job_id: String,
    /// Why the event was rejected.
    pub reason: String,
}

/// Response for a batch submission.
#[derive(Debug, Serialize)]
pub struct BatchSubmitResponse {
    /// Events in the request.
    pub total_submitted: usize,
    /// Events accepted into the buffer.
    pub total_accepted: usize,
    /// Events rejected by validation or enqueue failure.
    pub total_rejected: usize,
    /// Message IDs for the accepted events, in submission order.
    pub accepted_message_ids: Vec<MessageId>,
    /// Per-event rejections.
    pub rejected_events: Vec<RejectedEvent>,
}

/// Public view of a stored event.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    /// Stable event ID.
    pub id: EventId,
    /// Caller-supplied job identifier.
    pub external_job_id: String,
    /// Caller-supplied origin tag.
    pub source: String,
    /// Delivery-eligibility instant.
    pub scheduled_at: DateTime<Utc>,
    /// Delivery channel.
    pub delivery_type: DeliveryType,
    /// Destination URL or topic.
    pub destination: String,
    /// The payload, as submitted.
    pub payload: serde_json::Value,
    /// Lifecycle status.
    pub status: cadence_core::EventStatus,
    /// Delivery attempts made.
    pub retry_count: i32,
    /// Retry budget.
    pub max_retries: i32,
    /// Last delivery error, if any.
    pub last_error: Option<String>,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Terminal-transition timestamp.
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<ScheduledEvent> for EventResponse {
    fn from(event: ScheduledEvent) -> Self {
        let payload = serde_json::from_str(&event.payload)
            .unwrap_or(serde_json::Value::String(event.payload));
        Self {
            id: event.id,
            external_job_id: event.external_job_id,
            source: event.source,
            scheduled_at: event.scheduled_at,
            delivery_type: event.delivery_type,
            destination: event.destination,
            payload,
            status: event.status,
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            last_error: event.last_error,
            created_at: event.created_at,
            updated_at: event.updated_at,
            executed_at: event.executed_at,
        }
    }
}

/// Response for the statistics endpoint.
#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    /// Events waiting for their scheduled time.
    pub pending: u64,
    /// Events currently claimed.
    pub processing: u64,
    /// Events delivered successfully.
    pub completed: u64,
    /// Events parked after failure.
    pub dead_letter: u64,
    /// Events cancelled before delivery.
    pub cancelled: u64,
    /// All events.
    pub total: u64,
}

impl From<StatusCounts> for StatisticsResponse {
    fn from(counts: StatusCounts) -> Self {
        Self {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            dead_letter: counts.dead_letter,
            cancelled: counts.cancelled,
            total: counts.total(),
        }
    }
}

/// Query parameters for the manual cleanup endpoint.
#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    /// Retention window override in days.
    pub days: Option<u32>,
}

/// Response for cancellations.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// Human-readable acknowledgement.
    pub message: String,
    /// Number of events cancelled.
    pub cancelled: u64,
}

// ============================================================================
// Validation
// ============================================================================

/// Validates a submission and resolves its retry budget.
///
/// # Errors
///
/// Returns a human-readable reason when the request is malformed.
pub fn validate_request(
    request: &SubmitEventRequest,
    now: DateTime<Utc>,
    max_retries_default: i32,
) -> Result<i32, String> {
    if request.external_job_id.is_empty() || request.external_job_id.len() > 255 {
        return Err("external_job_id must be 1..=255 characters".to_string());
    }
    if request.source.is_empty() || request.source.len() > 100 {
        return Err("source must be 1..=100 characters".to_string());
    }
    if request.scheduled_at <= now {
        return Err("scheduled_at must be in the future".to_string());
    }
    if request.destination.is_empty() || request.destination.len() > 2048 {
        return Err("destination must be 1..=2048 characters".to_string());
    }
    match request.delivery_type {
        DeliveryType::Http => {
            if !request.destination.starts_with("http://")
                && !request.destination.starts_with("https://")
            {
                return Err("HTTP destination must begin with http:// or https://".to_string());
            }
        }
        DeliveryType::Kafka => {
            if request.destination.contains(char::is_whitespace) {
                return Err("KAFKA destination must not contain spaces".to_string());
            }
        }
    }
    let max_retries = request.max_retries.unwrap_or(max_retries_default);
    if !(0..=10).contains(&max_retries) {
        return Err("max_retries must be between 0 and 10".to_string());
    }
    Ok(max_retries)
}

fn to_message(request: &SubmitEventRequest, max_retries: i32) -> EventMessage {
    EventMessage {
        message_id: MessageId::generate(),
        external_job_id: request.external_job_id.clone(),
        source: request.source.clone(),
        scheduled_at: request.scheduled_at,
        delivery_type: request.delivery_type,
        destination: request.destination.clone(),
        payload: request.payload.to_string(),
        max_retries,
        received_at: Utc::now(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /api/v1/events`
pub async fn submit_event(
    State(state): State<AppState>,
    Json(request): Json<SubmitEventRequest>,
) -> ApiResult<(StatusCode, Json<SubmitEventResponse>)> {
    let max_retries = validate_request(&request, Utc::now(), state.max_retries_default)
        .map_err(ApiError::bad_request)?;

    let message = to_message(&request, max_retries);
    debug!(
        external_job_id = %message.external_job_id,
        source = %message.source,
        scheduled_at = %message.scheduled_at,
        "received event submission"
    );
    state.broker.produce_event(&message).await?;

    metrics::counter!(cadence_flow::metrics::names::EVENTS_RECEIVED_TOTAL).increment(1);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitEventResponse {
            message_id: message.message_id,
            message: "Event queued for processing",
        }),
    ))
}

/// `POST /api/v1/events/batch`
pub async fn submit_events_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSubmitRequest>,
) -> ApiResult<(StatusCode, Json<BatchSubmitResponse>)> {
    if request.events.is_empty() {
        return Err(ApiError::bad_request("batch must contain at least one event"));
    }
    if request.events.len() > MAX_BATCH_SIZE {
        return Err(ApiError::bad_request(format!(
            "batch must contain at most {MAX_BATCH_SIZE} events"
        )));
    }

    let now = Utc::now();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for (index, event) in request.events.iter().enumerate() {
        match validate_request(event, now, state.max_retries_default) {
            Ok(max_retries) => {
                let message = to_message(event, max_retries);
                match state.broker.produce_event(&message).await {
                    Ok(()) => accepted.push(message.message_id),
                    Err(e) => rejected.push(RejectedEvent {
                        index,
                        external_job_id: event.external_job_id.clone(),
                        reason: format!("enqueue failed: {e}"),
                    }),
                }
            }
            Err(reason) => rejected.push(RejectedEvent {
                index,
                external_job_id: event.external_job_id.clone(),
                reason,
            }),
        }
    }

    metrics::counter!(cadence_flow::metrics::names::EVENTS_RECEIVED_TOTAL)
        .increment(accepted.len() as u64);
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchSubmitResponse {
            total_submitted: request.events.len(),
            total_accepted: accepted.len(),
            total_rejected: rejected.len(),
            accepted_message_ids: accepted,
            rejected_events: rejected,
        }),
    ))
}

fn parse_event_id(raw: &str) -> ApiResult<EventId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("'{raw}' is not a valid event ID")))
}

/// `GET /api/v1/events/{id}`
pub async fn get_event_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventResponse>> {
    let id = parse_event_id(&id)?;
    let event = state
        .admin
        .get_event(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("event {id} not found")))?;
    Ok(Json(event.into()))
}

/// `GET /api/v1/events/external/{ext}`
pub async fn get_event_by_external_job_id(
    State(state): State<AppState>,
    Path(external_job_id): Path<String>,
) -> ApiResult<Json<EventResponse>> {
    let event = state
        .admin
        .get_event_by_external_job_id(&external_job_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("no event for external job ID '{external_job_id}'"))
        })?;
    Ok(Json(event.into()))
}

/// `GET /api/v1/events/external/{ext}/all`
pub async fn list_events_by_external_job_id(
    State(state): State<AppState>,
    Path(external_job_id): Path<String>,
) -> ApiResult<Json<Vec<EventResponse>>> {
    let events = state
        .admin
        .list_events_by_external_job_id(&external_job_id)
        .await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// `DELETE /api/v1/events/{id}`
pub async fn cancel_event_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let id = parse_event_id(&id)?;
    match state.admin.cancel_event(id).await? {
        CancelOutcome::Cancelled => Ok(Json(CancelResponse {
            message: "Event cancelled".to_string(),
            cancelled: 1,
        })),
        CancelOutcome::InvalidState(status) => Err(ApiError::invalid_state(format!(
            "event {id} is {status}; only PENDING events can be cancelled"
        ))),
        CancelOutcome::NotFound => Err(ApiError::not_found(format!("event {id} not found"))),
    }
}

/// `DELETE /api/v1/events/external/{ext}`
pub async fn cancel_events_by_external_job_id(
    State(state): State<AppState>,
    Path(external_job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state
        .admin
        .cancel_events_by_external_job_id(&external_job_id)
        .await?;
    if cancelled == 0 {
        return Err(ApiError::not_found(format!(
            "no pending events for external job ID '{external_job_id}'"
        )));
    }
    Ok(Json(CancelResponse {
        message: "Event(s) cancelled".to_string(),
        cancelled,
    }))
}

/// `GET /api/v1/events/statistics`
pub async fn statistics(State(state): State<AppState>) -> ApiResult<Json<StatisticsResponse>> {
    let counts = state.admin.statistics().await?;
    Ok(Json(counts.into()))
}

/// `POST /api/v1/events/admin/cleanup`
pub async fn manual_cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CleanupParams>,
) -> ApiResult<Json<CleanupResult>> {
    authorize_admin(&state, &headers)?;
    let days = params.days.unwrap_or(state.retention_days_default);
    let result = state.admin.manual_cleanup(days).await?;
    Ok(Json(result))
}

/// `GET /api/v1/events/health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::unauthorized(
            "admin endpoints are disabled; set CADENCE_ADMIN_TOKEN to enable them",
        ));
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::unauthorized("invalid or missing bearer token")),
    }
}
