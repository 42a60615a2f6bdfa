//! Static policy / SOP citation table.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::{CapabilityError, PolicyLookup};
use crate::config::defaults::MAX_POLICY_CITATIONS;

/// Rule id to citation list, matched by substring.
#[derive(Debug, Clone)]
pub struct StaticPolicyLookup {
    entries: BTreeMap<String, Vec<String>>,
}

impl Default for StaticPolicyLookup {
    fn default() -> Self {
        let entries = [
            (
                "panel_open_while_operating",
                "SOP-ELEC-4.2: Electrical panels stay closed while equipment is energized",
            ),
            (
                "guard_open_while_operating",
                "SOP-MECH-2.1: Machine guards must be in place before operation",
            ),
            (
                "unsafe_proximity_while_operating",
                "SOP-MECH-3.4: Keep 1 m clearance from operating machinery",
            ),
            (
                "restricted_area_entry",
                "SOP-ACCESS-1.3: Restricted areas require badge authorization",
            ),
            (
                "walkway_violation",
                "SOP-FLOOR-5.0: Pedestrians stay inside marked walkways",
            ),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
        }
    }
}

impl StaticPolicyLookup {
    pub const fn new(entries: BTreeMap<String, Vec<String>>) -> Self {
        Self { entries }
    }

    /// Load a `{ "rule_id": ["citation", ...] }` JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy table {}", path.display()))?;
        let entries = serde_json::from_str(&text)
            .with_context(|| format!("parsing policy table {}", path.display()))?;
        Ok(Self { entries })
    }

    /// Citations whose rule id appears in the query, or whose text contains it.
    pub fn find(&self, query: &str) -> Vec<String> {
        let q = query.to_ascii_lowercase();
        let mut hits: Vec<String> = Vec::new();
        for (rule, citations) in &self.entries {
            for citation in citations {
                let matched = q.contains(&rule.to_ascii_lowercase())
                    || (!q.is_empty() && citation.to_ascii_lowercase().contains(&q));
                if matched && !hits.contains(citation) {
                    hits.push(citation.clone());
                }
            }
        }
        hits.truncate(MAX_POLICY_CITATIONS);
        hits
    }
}

#[async_trait]
impl PolicyLookup for StaticPolicyLookup {
    async fn lookup(&self, query: &str) -> Result<Vec<String>, CapabilityError> {
        Ok(self.find(query))
    }
}
