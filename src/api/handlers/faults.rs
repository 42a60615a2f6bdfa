//! Fault scenario control

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::faults::FaultScenario;

use super::ApiState;

/// Body for activating or deactivating a scenario.
///
/// `scenario` uses the CLI syntax, e.g. `dispatcher_outage` or
/// `slow_stage:observer:2500`.
#[derive(Debug, Deserialize)]
pub struct FaultRequest {
    pub scenario: String,
}

#[derive(Debug, Serialize)]
pub struct FaultsResponse {
    pub active: Vec<FaultScenario>,
}

#[derive(Debug, Serialize)]
pub struct FaultChangeResponse {
    pub scenario: FaultScenario,
    /// Scenario displaced on the same component, if any
    pub replaced: Option<FaultScenario>,
    /// Whether a deactivation actually removed something
    pub changed: bool,
    pub active: Vec<FaultScenario>,
}

/// GET /api/v1/faults - Scenarios currently active
pub async fn get_faults(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(FaultsResponse {
        active: state.faults.active(),
    })
}

/// POST /api/v1/faults - Activate a scenario
pub async fn activate_fault(
    State(state): State<ApiState>,
    Json(req): Json<FaultRequest>,
) -> Response {
    let scenario = match FaultScenario::parse(&req.scenario, &state.config.slo) {
        Ok(s) => s,
        Err(e) => return ApiErrorResponse::bad_request(e),
    };
    let replaced = state.faults.activate(scenario);
    info!(%scenario, "Fault scenario activated via API");
    ApiResponse::ok(FaultChangeResponse {
        scenario,
        replaced,
        changed: true,
        active: state.faults.active(),
    })
}

/// POST /api/v1/faults/deactivate - Clear one scenario
pub async fn deactivate_fault(
    State(state): State<ApiState>,
    Json(req): Json<FaultRequest>,
) -> Response {
    let scenario = match FaultScenario::parse(&req.scenario, &state.config.slo) {
        Ok(s) => s,
        Err(e) => return ApiErrorResponse::bad_request(e),
    };
    let changed = state.faults.deactivate(scenario);
    ApiResponse::ok(FaultChangeResponse {
        scenario,
        replaced: None,
        changed,
        active: state.faults.active(),
    })
}

/// POST /api/v1/faults/reset - Clear every scenario
pub async fn reset_faults(State(state): State<ApiState>) -> Response {
    state.faults.deactivate_all();
    info!("All fault scenarios cleared via API");
    ApiResponse::ok(FaultsResponse {
        active: state.faults.active(),
    })
}
