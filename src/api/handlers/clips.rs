//! Clip submission

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::defaults::DEMO_CLIP_SECONDS;
use crate::pipeline::IntakeError;
use crate::types::Clip;

use super::ApiState;

/// Body for `POST /api/v1/clips`.
#[derive(Debug, Deserialize)]
pub struct ClipSubmission {
    pub source_id: String,
    #[serde(default)]
    pub index: u64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ClipSubmission {
    pub fn into_clip(self) -> Result<Clip, String> {
        if self.source_id.trim().is_empty() {
            return Err("source_id must not be empty".to_string());
        }
        let start = self.start.unwrap_or_else(Utc::now);
        let end = self
            .end
            .unwrap_or_else(|| start + chrono::Duration::seconds(DEMO_CLIP_SECONDS));
        if end < start {
            return Err(format!("clip end ({end}) precedes start ({start})"));
        }
        let mut clip = Clip::new(self.source_id, self.index, start, end).with_tags(self.tags);
        if let Some(payload_ref) = self.payload_ref {
            clip.payload_ref = payload_ref;
        }
        Ok(clip)
    }
}

#[derive(Debug, Serialize)]
pub struct ClipAccepted {
    pub clip_id: String,
    pub queue_depth: usize,
}

/// POST /api/v1/clips - Queue a clip for processing
///
/// 202 when queued, 429 when the intake queue is full.
pub async fn submit_clip(
    State(state): State<ApiState>,
    Json(body): Json<ClipSubmission>,
) -> Response {
    let clip = match body.into_clip() {
        Ok(c) => c,
        Err(e) => return ApiErrorResponse::bad_request(e),
    };
    let clip_id = clip.id.clone();
    match state.intake.submit(clip) {
        Ok(()) => {
            debug!(clip_id = %clip_id, "Clip queued via API");
            ApiResponse::accepted(ClipAccepted {
                clip_id,
                queue_depth: state.intake.depth(),
            })
        }
        Err(IntakeError::QueueFull) => {
            warn!(clip_id = %clip_id, "Clip rejected, intake queue full");
            ApiErrorResponse::too_many_requests(IntakeError::QueueFull.to_string())
        }
        Err(e @ IntakeError::Closed) => ApiErrorResponse::service_unavailable(e.to_string()),
    }
}
