//! Degradation Policy - cap the recommended action when a decision is weak
//!
//! A decision whose confidence or groundedness falls below its threshold
//! has its action capped at the configured ceiling. Severity is untouched
//! and an action already at or below the ceiling is left alone, so applying
//! the policy twice changes nothing.

use serde::Serialize;

use crate::config::DegradationConfig;
use crate::types::{ActionType, Decision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeReason {
    LowConfidence,
    LowGroundedness,
    LowConfidenceAndGroundedness,
}

impl DowngradeReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::LowGroundedness => "low_groundedness",
            Self::LowConfidenceAndGroundedness => "low_confidence_and_groundedness",
        }
    }
}

/// A downgrade that actually changed the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Downgrade {
    pub from: ActionType,
    pub to: ActionType,
    pub reason: DowngradeReason,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationPolicy {
    min_confidence: f64,
    min_groundedness: f64,
    ceiling: ActionType,
}

impl DegradationPolicy {
    pub const fn new(min_confidence: f64, min_groundedness: f64, ceiling: ActionType) -> Self {
        Self {
            min_confidence,
            min_groundedness,
            ceiling,
        }
    }

    pub const fn from_config(config: &DegradationConfig) -> Self {
        Self::new(config.min_confidence, config.min_groundedness, config.ceiling)
    }

    pub const fn ceiling(&self) -> ActionType {
        self.ceiling
    }

    fn reason(&self, decision: &Decision) -> Option<DowngradeReason> {
        let weak_confidence = decision.confidence < self.min_confidence;
        let weak_grounding = decision.groundedness < self.min_groundedness;
        match (weak_confidence, weak_grounding) {
            (true, true) => Some(DowngradeReason::LowConfidenceAndGroundedness),
            (true, false) => Some(DowngradeReason::LowConfidence),
            (false, true) => Some(DowngradeReason::LowGroundedness),
            (false, false) => None,
        }
    }

    /// Apply the policy. The second value is `Some` only when the action changed.
    pub fn apply(&self, mut decision: Decision) -> (Decision, Option<Downgrade>) {
        let Some(reason) = self.reason(&decision) else {
            return (decision, None);
        };
        let from = decision.recommended_action;
        let to = from.min(self.ceiling);
        if to == from {
            return (decision, None);
        }

        decision.recommended_action = to;
        let note = format!(
            "[degradation_applied] {from} capped at {to} ({}: confidence {:.2}, groundedness {:.2})",
            reason.as_str(),
            decision.confidence,
            decision.groundedness
        );
        if decision.rationale.is_empty() {
            decision.rationale = note;
        } else {
            decision.rationale = format!("{} {note}", decision.rationale);
        }
        (decision, Some(Downgrade { from, to, reason }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Evidence, Severity};
    use chrono::Utc;

    fn decision(action: ActionType, confidence: f64, groundedness: f64) -> Decision {
        Decision {
            observation_id: "obs-1".to_string(),
            violation: true,
            rule_id: Some("guard_open_while_operating".to_string()),
            severity: Severity::Critical,
            confidence,
            groundedness,
            recommended_action: action,
            rationale: "Guard open on an operating press".to_string(),
            citations: vec!["SOP-MECH-2.1".to_string()],
            evidence: Evidence {
                clip_id: "clip-1".to_string(),
                start: Utc::now(),
                end: Utc::now(),
            },
        }
    }

    fn policy() -> DegradationPolicy {
        DegradationPolicy::from_config(&DegradationConfig::default())
    }

    #[test]
    fn test_strong_decision_untouched() {
        let d = decision(ActionType::StopLine, 0.9, 0.9);
        let (out, downgrade) = policy().apply(d.clone());
        assert!(downgrade.is_none());
        assert_eq!(out, d);
    }

    #[test]
    fn test_low_confidence_caps_at_ceiling() {
        let (out, downgrade) = policy().apply(decision(ActionType::StopLine, 0.4, 0.9));
        let downgrade = downgrade.unwrap();
        assert_eq!(downgrade.from, ActionType::StopLine);
        assert_eq!(downgrade.to, ActionType::Alert);
        assert_eq!(downgrade.reason, DowngradeReason::LowConfidence);
        assert_eq!(out.recommended_action, ActionType::Alert);
        assert_eq!(out.severity, Severity::Critical);
        assert!(out.rationale.contains("[degradation_applied]"));
    }

    #[test]
    fn test_ungrounded_caps_and_reports_both() {
        let (_, downgrade) = policy().apply(decision(ActionType::Page, 0.1, 0.0));
        assert_eq!(downgrade.unwrap().reason, DowngradeReason::LowConfidenceAndGroundedness);
    }

    #[test]
    fn test_never_escalates() {
        let (out, downgrade) = policy().apply(decision(ActionType::Log, 0.1, 0.1));
        assert!(downgrade.is_none());
        assert_eq!(out.recommended_action, ActionType::Log);
    }

    #[test]
    fn test_idempotent() {
        let (once, first) = policy().apply(decision(ActionType::StopLine, 0.3, 0.2));
        let (twice, second) = policy().apply(once.clone());
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(once, twice);
    }
}
