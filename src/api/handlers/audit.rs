//! Audit query surface: events, KPI roll-up, incidents

use axum::extract::{Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::audit::AuditFilter;
use crate::config::defaults::{AUDIT_QUERY_DEFAULT_LIMIT, AUDIT_QUERY_MAX_LIMIT};
use crate::types::{AuditEvent, AuditKind, CaseRecord, IncidentRecord, Stage};

use super::ApiState;

// ============================================================================
// Audit Events
// ============================================================================

/// Query string for `GET /api/v1/audit`.
///
/// `kind` accepts a comma-separated list.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQueryParams {
    pub clip_id: Option<String>,
    pub kind: Option<String>,
    pub stage: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub after_seq: Option<u64>,
    pub limit: Option<usize>,
}

impl AuditQueryParams {
    /// Convert into a store filter, clamping the limit.
    pub fn into_filter(self) -> Result<AuditFilter, String> {
        let kinds = match self.kind.as_deref() {
            Some(raw) => raw
                .split(',')
                .filter(|k| !k.trim().is_empty())
                .map(str::parse::<AuditKind>)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let stage = self
            .stage
            .as_deref()
            .map(str::parse::<Stage>)
            .transpose()?;
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since >= until {
                return Err(format!("'since' ({since}) must be earlier than 'until' ({until})"));
            }
        }
        let limit = self
            .limit
            .unwrap_or(AUDIT_QUERY_DEFAULT_LIMIT)
            .min(AUDIT_QUERY_MAX_LIMIT);

        Ok(AuditFilter {
            clip_id: self.clip_id.filter(|c| !c.is_empty()),
            kinds,
            stage,
            since: self.since,
            until: self.until,
            after_seq: self.after_seq,
            limit: Some(limit),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct AuditEventsResponse {
    pub count: usize,
    /// Highest sequence number in this page, for `after_seq` paging
    pub last_seq: Option<u64>,
    pub events: Vec<AuditEvent>,
}

/// GET /api/v1/audit - Filtered, read-only view of the audit log
pub async fn get_audit_events(
    State(state): State<ApiState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let filter = match params.into_filter() {
        Ok(f) => f,
        Err(e) => return ApiErrorResponse::bad_request(e),
    };
    match state.audit.events(filter) {
        Ok(events) => ApiResponse::ok(AuditEventsResponse {
            count: events.len(),
            last_seq: events.last().map(|e| e.seq),
            events,
        }),
        Err(e) => {
            error!(error = %e, "Audit query failed");
            ApiErrorResponse::internal(e.to_string())
        }
    }
}

/// GET /api/v1/audit/kpi - KPI roll-up computed from the audit log
pub async fn get_audit_kpi(State(state): State<ApiState>) -> Response {
    match state.audit.kpi() {
        Ok(kpi) => ApiResponse::ok(kpi),
        Err(e) => {
            error!(error = %e, "KPI roll-up failed");
            ApiErrorResponse::internal(e.to_string())
        }
    }
}

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Serialize)]
pub struct IncidentsResponse {
    pub incidents: Vec<IncidentRecord>,
    pub cases: Vec<CaseRecord>,
}

/// GET /api/v1/incidents - Incidents and cases opened by the escalator
pub async fn get_incidents(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(IncidentsResponse {
        incidents: state.escalator.incidents(),
        cases: state.escalator.cases(),
    })
}
