//! Thinker decisions and the action vocabulary they recommend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clip::{Clip, Observation};
use super::parsing::{check_unit, ParseError, StageOutput};

// ============================================================================
// Severity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Action Type
// ============================================================================

/// Operator-facing action, ordered by impact: `none < log < alert < page < stop_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum ActionType {
    None,
    Log,
    Alert,
    Page,
    StopLine,
}

impl ActionType {
    /// Canonicalize a loose model string.
    ///
    /// Accepts the canonical names plus common synonyms
    /// (`stop`, `halt`, `shutdown`, `warn`, `notify`).
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let norm = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match norm.as_str() {
            "none" | "no_action" => Ok(Self::None),
            "log" | "record" => Ok(Self::Log),
            "alert" | "warn" | "warning" | "notify" => Ok(Self::Alert),
            "page" | "escalate" => Ok(Self::Page),
            "stop_line" | "stopline" | "stop" | "halt" | "shutdown" => Ok(Self::StopLine),
            _ => Err(ParseError::UnknownAction(raw.to_string())),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Log => "log",
            Self::Alert => "alert",
            Self::Page => "page",
            Self::StopLine => "stop_line",
        }
    }
}

impl TryFrom<String> for ActionType {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Raw Thinker output. Citations and evidence are attached by the pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkerOutput {
    pub violation: bool,
    pub rule_id: Option<String>,
    pub severity: Severity,
    pub confidence: f64,
    pub groundedness: f64,
    pub recommended_action: ActionType,
    pub rationale: String,
}

impl StageOutput for ThinkerOutput {
    fn validate(&self) -> Result<(), ParseError> {
        check_unit("confidence", self.confidence)?;
        check_unit("groundedness", self.groundedness)?;
        if self.violation && self.rule_id.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err(ParseError::Malformed(
                "violation without a rule_id".to_string(),
            ));
        }
        Ok(())
    }
}

/// Clip and time range a decision is based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub clip_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Policy decision for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub observation_id: String,
    pub violation: bool,
    pub rule_id: Option<String>,
    pub severity: Severity,
    pub confidence: f64,
    pub groundedness: f64,
    pub recommended_action: ActionType,
    pub rationale: String,
    pub citations: Vec<String>,
    pub evidence: Evidence,
}

impl Decision {
    /// Attach citations and evidence to the Thinker's output.
    ///
    /// A decision with no citations is ungrounded, whatever the model claims.
    pub fn from_output(
        clip: &Clip,
        observation: &Observation,
        output: ThinkerOutput,
        citations: Vec<String>,
    ) -> Self {
        let groundedness = if citations.is_empty() {
            0.0
        } else {
            output.groundedness
        };
        Self {
            observation_id: observation.id.clone(),
            violation: output.violation,
            rule_id: output.rule_id,
            severity: output.severity,
            confidence: output.confidence,
            groundedness,
            recommended_action: output.recommended_action,
            rationale: output.rationale,
            citations,
            evidence: Evidence {
                clip_id: clip.id.clone(),
                start: clip.start,
                end: clip.end,
            },
        }
    }
}
