//! Operator actions produced by the Doer.

use serde::{Deserialize, Serialize};

use super::decision::{ActionType, Decision, Severity};
use super::parsing::{ParseError, StageOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    /// Default priority for a severity when the Doer gives none.
    pub const fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => Self::P1,
            Severity::Medium => Self::P2,
            Severity::Low => Self::P3,
        }
    }
}

/// Raw Doer output.
///
/// `action_type` is optional and only checked against the decision. The
/// Doer cannot change it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoerOutput {
    #[serde(default)]
    pub action_type: Option<ActionType>,
    pub target: String,
    pub operator_message: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl StageOutput for DoerOutput {
    fn validate(&self) -> Result<(), ParseError> {
        if self.target.trim().is_empty() {
            return Err(ParseError::Malformed("target is empty".to_string()));
        }
        if self.operator_message.trim().is_empty() {
            return Err(ParseError::Malformed("operator_message is empty".to_string()));
        }
        Ok(())
    }
}

/// A deliverable action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub target: String,
    pub operator_message: String,
    pub steps: Vec<String>,
    pub priority: Priority,
    pub notes: Vec<String>,
}

impl Action {
    /// Build the action from the Doer's output, keeping the decision's type.
    pub fn from_output(decision: &Decision, output: DoerOutput) -> Self {
        let mut notes = output.notes;
        if let Some(requested) = output.action_type {
            if requested != decision.recommended_action {
                tracing::warn!(
                    requested = %requested,
                    decided = %decision.recommended_action,
                    "Doer tried to change the action type, keeping the decision's"
                );
                notes.push(format!(
                    "doer requested '{requested}', kept '{}'",
                    decision.recommended_action
                ));
            }
        }
        Self {
            action_type: decision.recommended_action,
            target: output.target,
            operator_message: output.operator_message,
            steps: output.steps,
            priority: output
                .priority
                .unwrap_or_else(|| Priority::for_severity(decision.severity)),
            notes,
        }
    }
}
