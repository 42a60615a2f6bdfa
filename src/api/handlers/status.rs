//! System state endpoints: health / readiness and the running config

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::api::envelope::ApiResponse;
use crate::health::ComponentHealth;

use super::ApiState;

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub version: &'static str,
    pub components: Vec<ComponentHealth>,
    pub queue_depth: usize,
    pub watchdog_timers_in_flight: u64,
    pub uptime_secs: u64,
}

/// GET /health - Readiness probe
///
/// 200 once the audit log and worker pool have both initialized, 503 before.
pub async fn health_check(State(state): State<ApiState>) -> Response {
    let ready = state.readiness.is_ready();
    let body = HealthResponse {
        status: if ready { "ready" } else { "starting" },
        service: state.config.service.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        components: state.readiness.components(),
        queue_depth: state.intake.depth(),
        watchdog_timers_in_flight: state
            .metrics
            .gauge("watchdog_timers_in_flight", &[])
            .map_or(0, |v| v.max(0.0) as u64),
        uptime_secs: state.metrics.uptime_secs(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Config Endpoint
// ============================================================================

/// GET /api/v1/config - Running pipeline configuration
pub async fn get_config(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.config.as_ref().clone())
}
