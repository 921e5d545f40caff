//! REST API handlers.
//!
//! Reads come from the controller's published status and the telemetry
//! handle. Writes are commands sent through the `RotationHandle`.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use carousel_core::Trigger;
use carousel_rotation::RotationError;
use tracing::info;

use crate::ApiState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a refused controller request.
fn rejection_status(err: &RotationError) -> StatusCode {
    match err {
        RotationError::RotationInProgress | RotationError::NotQuarantined(_) => StatusCode::CONFLICT,
        RotationError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        RotationError::RuntimeUnavailable | RotationError::ControllerStopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn rejection(err: RotationError) -> axum::response::Response {
    error_response(&err.to_string(), rejection_status(&err)).into_response()
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({ "status": "ok" }))
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.rotation.status())
}

// ── Telemetry ──────────────────────────────────────────────────

/// GET /api/v1/telemetry
pub async fn get_telemetry(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.telemetry.snapshot())
}

#[derive(Debug, serde::Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/history?limit=N
pub async fn list_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    ApiResponse::ok(state.telemetry.recent(limit))
}

// ── Operator actions ───────────────────────────────────────────

/// POST /api/v1/rotate
pub async fn trigger_rotation(State(state): State<ApiState>) -> impl IntoResponse {
    match state.rotation.rotate(Trigger::Manual).await {
        Ok(plan_id) => {
            info!(plan = plan_id, "manual rotation accepted");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "plan_id": plan_id })),
            )
                .into_response()
        }
        Err(e) => rejection(e),
    }
}

/// POST /api/v1/instances/{name}/unquarantine
pub async fn clear_quarantine(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.rotation.clear_quarantine(&name).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "instance": name, "role": "standby" })).into_response(),
        Err(e) => rejection(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = carousel_telemetry::render_prometheus(&state.telemetry.snapshot(), &state.rotation.status());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
