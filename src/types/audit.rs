//! Audit event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Stage;

/// Every kind of state transition the pipeline records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    StageStart,
    StageComplete,
    StageTimeout,
    ToolError,
    ParseFail,
    DegradationApplied,
    ActionSent,
    ActionFailed,
    ActionSkipped,
    SecurityBlock,
    IncidentCreated,
    CaseCreated,
}

impl AuditKind {
    pub const ALL: [Self; 12] = [
        Self::StageStart,
        Self::StageComplete,
        Self::StageTimeout,
        Self::ToolError,
        Self::ParseFail,
        Self::DegradationApplied,
        Self::ActionSent,
        Self::ActionFailed,
        Self::ActionSkipped,
        Self::SecurityBlock,
        Self::IncidentCreated,
        Self::CaseCreated,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StageStart => "stage_start",
            Self::StageComplete => "stage_complete",
            Self::StageTimeout => "stage_timeout",
            Self::ToolError => "tool_error",
            Self::ParseFail => "parse_fail",
            Self::DegradationApplied => "degradation_applied",
            Self::ActionSent => "action_sent",
            Self::ActionFailed => "action_failed",
            Self::ActionSkipped => "action_skipped",
            Self::SecurityBlock => "security_block",
            Self::IncidentCreated => "incident_created",
            Self::CaseCreated => "case_created",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown audit kind '{s}'"))
    }
}

/// One immutable entry in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Gap-free, strictly increasing, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub clip_id: Option<String>,
    pub stage: Option<Stage>,
    pub payload: Value,
}

impl AuditEvent {
    /// Whether this event closes its clip's run.
    pub fn is_terminal(&self) -> bool {
        self.payload
            .get("terminal")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Milliseconds field from the payload, if present.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// An event before the log assigns its sequence number and timestamp.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub kind: AuditKind,
    pub clip_id: Option<String>,
    pub stage: Option<Stage>,
    pub payload: Value,
}

impl AuditDraft {
    pub const fn new(kind: AuditKind) -> Self {
        Self {
            kind,
            clip_id: None,
            stage: None,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn clip(mut self, clip_id: impl Into<String>) -> Self {
        self.clip_id = Some(clip_id.into());
        self
    }

    #[must_use]
    pub const fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Mark this event as the one that closes the clip's run.
    #[must_use]
    pub fn terminal(mut self, state: &str) -> Self {
        if !self.payload.is_object() {
            self.payload = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.payload {
            map.insert("terminal".to_string(), Value::Bool(true));
            map.insert("state".to_string(), Value::String(state.to_string()));
        }
        self
    }

    /// Record how long the clip took from intake to this event.
    #[must_use]
    pub fn clip_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        if !self.payload.is_object() {
            self.payload = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.payload {
            let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            map.insert("clip_elapsed_ms".to_string(), Value::from(ms));
        }
        self
    }
}
