//! Deterministic stand-in for the three model stages.
//!
//! The Observer reads clip tags: a tag naming a known signal reads `yes`,
//! `uncertain:<signal>` reads `uncertain`, everything else `no`. Two tags
//! force failures: `observer_error` (tool error) and `observer_malformed`
//! (output missing its signals).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{CapabilityError, ModelCapability};
use crate::pipeline::triggers::{KNOWN_SIGNALS, RULES};
use crate::types::{Clip, Stage};

#[derive(Debug, Clone, Copy, Default)]
pub struct StubModel;

impl StubModel {
    pub const fn new() -> Self {
        Self
    }

    fn observe(input: &Value) -> Result<Value, CapabilityError> {
        let clip: Clip = serde_json::from_value(input.get("clip").cloned().unwrap_or(Value::Null))
            .map_err(|e| CapabilityError::Failed(format!("observer input: {e}")))?;

        if clip.has_tag("observer_error") {
            return Err(CapabilityError::Unavailable("vision backend returned 503".to_string()));
        }

        let mut signals = Map::new();
        let mut seen = Vec::new();
        for name in KNOWN_SIGNALS {
            let value = if clip.has_tag(name) {
                seen.push(*name);
                "yes"
            } else if clip.has_tag(&format!("uncertain:{name}")) {
                seen.push(*name);
                "uncertain"
            } else {
                "no"
            };
            signals.insert((*name).to_string(), json!(value));
        }

        let summary = if seen.is_empty() {
            format!("Camera {} clip #{}: no hazards observed", clip.source_id, clip.index)
        } else {
            format!("Camera {} clip #{}: {}", clip.source_id, clip.index, seen.join(", "))
        };

        if clip.has_tag("observer_malformed") {
            return Ok(json!({ "summary": summary }));
        }
        Ok(json!({ "summary": summary, "signals": signals }))
    }

    fn think(input: &Value) -> Value {
        let grounded = input
            .get("citations")
            .and_then(Value::as_array)
            .is_some_and(|c| !c.is_empty());
        let groundedness = if grounded { 0.85 } else { 0.0 };
        let uncertain = input.get("uncertain").and_then(Value::as_bool).unwrap_or(false);

        let top = input
            .get("triggered_rules")
            .and_then(Value::as_array)
            .and_then(|rules| rules.first())
            .and_then(Value::as_str)
            .and_then(|id| RULES.iter().find(|r| r.id == id));

        match top {
            Some(rule) => json!({
                "violation": true,
                "rule_id": rule.id,
                "severity": rule.severity,
                "confidence": if uncertain { 0.45 } else { 0.9 },
                "groundedness": groundedness,
                "recommended_action": rule.action,
                "rationale": format!("Signals {} satisfy rule {}", rule.requires.join(" + "), rule.id),
            }),
            None => json!({
                "violation": false,
                "rule_id": null,
                "severity": "LOW",
                "confidence": 0.95,
                "groundedness": groundedness,
                "recommended_action": "none",
                "rationale": "No safety rule triggered",
            }),
        }
    }

    fn act(input: &Value) -> Value {
        let decision = input.get("decision").cloned().unwrap_or(Value::Null);
        let action = decision
            .get("recommended_action")
            .and_then(Value::as_str)
            .unwrap_or("log");
        let rule = decision.get("rule_id").and_then(Value::as_str).unwrap_or("unspecified");
        let target = input
            .get("source_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown-source");

        let steps: &[&str] = match action {
            "stop_line" => &[
                "Press the line stop for the affected cell",
                "Lock out and tag out the machine",
                "Notify the shift supervisor",
            ],
            "page" => &["Page the on-call safety lead", "Hold the area until acknowledged"],
            "alert" => &["Send an alert to the area operator", "Confirm the hazard is cleared"],
            _ => &["Record the observation in the shift log"],
        };

        json!({
            "target": target,
            "operator_message": format!("{rule} detected on {target}: {action}"),
            "steps": steps,
        })
    }
}

#[async_trait]
impl ModelCapability for StubModel {
    async fn complete(&self, stage: Stage, input: Value, _timeout: Duration) -> Result<Value, CapabilityError> {
        match stage {
            Stage::Observer => Self::observe(&input),
            Stage::Thinker => Ok(Self::think(&input)),
            Stage::Doer => Ok(Self::act(&input)),
            Stage::Dispatcher => Err(CapabilityError::Unavailable(
                "dispatcher is not a model stage".to_string(),
            )),
        }
    }
}
