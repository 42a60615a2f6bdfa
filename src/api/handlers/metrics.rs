//! Observability: Prometheus metrics

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use super::ApiState;

/// GET /metrics
///
/// Every counter, gauge and histogram in the registry in Prometheus text
/// format (version 0.0.4).
pub async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
