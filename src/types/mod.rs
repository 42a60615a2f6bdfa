//! Core domain types shared across the pipeline.
//!
//! Model payloads are parsed into the records here with a fixed, validated
//! field set. Anything partial or out of range is a [`ParseError`].

mod action;
mod audit;
mod clip;
mod decision;
mod incident;
mod parsing;

pub use action::{Action, DoerOutput, Priority};
pub use audit::{AuditDraft, AuditEvent, AuditKind};
pub use clip::{Clip, Observation, ObserverOutput, SignalValue, TriState};
pub use decision::{ActionType, Decision, Evidence, Severity, ThinkerOutput};
pub use incident::{CasePriority, CaseRecord, IncidentRecord, IncidentSeverity};
pub use parsing::{parse_stage_output, ParseError, StageOutput};

use serde::{Deserialize, Serialize};

// ============================================================================
// Stage
// ============================================================================

/// A timed step of the pipeline.
///
/// The Dispatcher is timed like a stage but is not run by the stage runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Observer,
    Thinker,
    Doer,
    Dispatcher,
}

impl Stage {
    /// The three model-backed stages in execution order.
    pub const MODEL_STAGES: [Self; 3] = [Self::Observer, Self::Thinker, Self::Doer];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Thinker => "thinker",
            Self::Doer => "doer",
            Self::Dispatcher => "dispatcher",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observer" => Ok(Self::Observer),
            "thinker" => Ok(Self::Thinker),
            "doer" => Ok(Self::Doer),
            "dispatcher" => Ok(Self::Dispatcher),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}
