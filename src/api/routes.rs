//! API route definitions
//!
//! - /health - Readiness (200 ready, 503 starting)
//! - /metrics - Prometheus text exposition
//! - /api/v1/audit - Filtered audit events and KPI roll-up
//! - /api/v1/incidents - Escalated incidents and cases
//! - /api/v1/faults - Fault scenario control
//! - /api/v1/clips - Clip intake
//! - /api/v1/config - Running configuration

use axum::{routing::{get, post}, Router};

use super::handlers::{self, ApiState};

/// Routes nested under `/api/v1`
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/audit", get(handlers::get_audit_events))
        .route("/audit/kpi", get(handlers::get_audit_kpi))
        .route("/incidents", get(handlers::get_incidents))
        .route("/faults", get(handlers::get_faults).post(handlers::activate_fault))
        .route("/faults/deactivate", post(handlers::deactivate_fault))
        .route("/faults/reset", post(handlers::reset_faults))
        .route("/clips", post(handlers::submit_clip))
        .route("/config", get(handlers::get_config))
        .with_state(state)
}

/// Probe and scrape endpoints at root level
pub fn root_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::get_metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::engine::Engine;
    use crate::pipeline::WorkerPool;
    use crate::types::{AuditDraft, AuditKind};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct Harness {
        state: ApiState,
        engine: Engine,
        // Held but never run, so queued clips stay queued.
        _pool: WorkerPool,
    }

    fn harness(intake_capacity: usize) -> Harness {
        let mut config = PipelineConfig::default();
        config.workers.intake_capacity = intake_capacity;
        let (engine, _) = Engine::in_memory(config).unwrap();
        let (intake, pool) = engine.worker_pool();
        Harness {
            state: ApiState::from_engine(&engine, intake),
            engine,
            _pool: pool,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_starting_until_workers_ready() {
        let h = harness(8);
        let app = root_routes(h.state.clone());

        let response = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "starting");
        assert!(json["uptime_secs"].is_u64());

        h.engine.readiness.mark_workers_ready();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let h = harness(8);
        let response = root_routes(h.state.clone()).oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain; version=0.0.4"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("stagewarden_uptime_seconds"));
    }

    #[tokio::test]
    async fn test_audit_query_filters_by_clip() {
        let h = harness(8);
        h.engine
            .audit
            .append(AuditDraft::new(AuditKind::StageStart).clip("clip-a"))
            .unwrap();
        h.engine
            .audit
            .append(AuditDraft::new(AuditKind::StageStart).clip("clip-b"))
            .unwrap();

        let response = api_routes(h.state.clone())
            .oneshot(get_req("/audit?clip_id=clip-b"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["count"], 1);
        assert_eq!(json["data"]["events"][0]["clip_id"], "clip-b");
    }

    #[tokio::test]
    async fn test_audit_query_rejects_bad_kind() {
        let h = harness(8);
        let response = api_routes(h.state.clone())
            .oneshot(get_req("/audit?kind=nonsense"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_clip_intake_accepts_then_rejects() {
        let h = harness(1);
        let app = api_routes(h.state.clone());
        let body = serde_json::json!({"source_id": "cam-1", "tags": ["ppe_missing"]});

        let response = app.clone().oneshot(post_json("/clips", body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app.oneshot(post_json("/clips", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_fault_activate_and_reset() {
        let h = harness(8);
        let app = api_routes(h.state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/faults", serde_json::json!({"scenario": "dispatcher_outage"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.engine.faults.dispatcher_outage());

        let response = app
            .clone()
            .oneshot(post_json("/faults", serde_json::json!({"scenario": "meteor_strike"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/faults/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.engine.faults.active().is_empty());
    }

    #[tokio::test]
    async fn test_incidents_empty() {
        let h = harness(8);
        let response = api_routes(h.state.clone()).oneshot(get_req("/incidents")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["incidents"].as_array().unwrap().len(), 0);
    }
}
