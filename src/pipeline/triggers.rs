//! Deterministic safety rules evaluated over Observer signals.
//!
//! The triggered rule ids key the policy lookup before the Thinker runs.

use crate::types::{ActionType, Observation, Severity};

/// A rule that fires when all of its signals read positive.
#[derive(Debug, PartialEq, Eq)]
pub struct TriggerRule {
    pub id: &'static str,
    pub requires: &'static [&'static str],
    pub severity: Severity,
    pub action: ActionType,
}

/// Rules in priority order, most severe first.
pub const RULES: &[TriggerRule] = &[
    TriggerRule {
        id: "panel_open_while_operating",
        requires: &["panel_open", "machine_operating"],
        severity: Severity::Critical,
        action: ActionType::StopLine,
    },
    TriggerRule {
        id: "guard_open_while_operating",
        requires: &["guard_open", "machine_operating"],
        severity: Severity::Critical,
        action: ActionType::StopLine,
    },
    TriggerRule {
        id: "unsafe_proximity_while_operating",
        requires: &["unsafe_proximity_to_machine", "machine_operating"],
        severity: Severity::High,
        action: ActionType::StopLine,
    },
    TriggerRule {
        id: "restricted_area_entry",
        requires: &["restricted_area_entry"],
        severity: Severity::High,
        action: ActionType::Alert,
    },
    TriggerRule {
        id: "walkway_violation",
        requires: &["walkway_violation"],
        severity: Severity::Medium,
        action: ActionType::Alert,
    },
];

/// Every signal name the rules read.
pub const KNOWN_SIGNALS: &[&str] = &[
    "walkway_violation",
    "restricted_area_entry",
    "unsafe_proximity_to_machine",
    "machine_operating",
    "panel_open",
    "guard_open",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggeredRule {
    pub rule: &'static TriggerRule,
    /// At least one required signal was `uncertain` rather than positive
    pub uncertain: bool,
}

/// Rules whose required signals are all positive or uncertain, in priority order.
pub fn evaluate(observation: &Observation) -> Vec<TriggeredRule> {
    RULES
        .iter()
        .filter(|rule| {
            rule.requires
                .iter()
                .all(|s| observation.is_positive(s) || observation.is_uncertain(s))
        })
        .map(|rule| TriggeredRule {
            rule,
            uncertain: rule.requires.iter().any(|s| observation.is_uncertain(s)),
        })
        .collect()
}

/// Lookup query for a set of triggered rules.
pub fn lookup_query(triggered: &[TriggeredRule], observation: &Observation) -> String {
    if triggered.is_empty() {
        observation.summary.clone()
    } else {
        triggered
            .iter()
            .map(|t| t.rule.id)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
