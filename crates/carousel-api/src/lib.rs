//! carousel-api — admin API for Carousel.
//!
//! Read-only views of the rotation state and telemetry, plus the two
//! operator actions: a manual rotation trigger and quarantine clearing.
//! Both actions go through the controller's command channel; the API
//! never touches rotation state directly.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Orchestrator liveness |
//! | GET | `/api/v1/status` | Instances, current and last plan, alerts |
//! | GET | `/api/v1/telemetry` | Cached telemetry snapshot |
//! | GET | `/api/v1/history?limit=N` | Most recent finished plans |
//! | POST | `/api/v1/rotate` | Manual rotation trigger |
//! | POST | `/api/v1/instances/{name}/unquarantine` | Return an instance to Standby |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use carousel_rotation::RotationHandle;
use carousel_telemetry::Telemetry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub rotation: RotationHandle,
    pub telemetry: Telemetry,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/telemetry", get(handlers::get_telemetry))
        .route("/history", get(handlers::list_history))
        .route("/rotate", post(handlers::trigger_rotation))
        .route("/instances/{name}/unquarantine", post(handlers::clear_quarantine))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
