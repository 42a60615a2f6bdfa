//! Incident and case records created by escalation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IncidentSeverity {
    #[serde(rename = "SEV-1")]
    Sev1,
    #[serde(rename = "SEV-2")]
    Sev2,
    #[serde(rename = "SEV-3")]
    Sev3,
    #[serde(rename = "SEV-4")]
    Sev4,
    #[serde(rename = "SEV-5")]
    Sev5,
}

impl std::fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = match self {
            Self::Sev1 => 1,
            Self::Sev2 => 2,
            Self::Sev3 => 3,
            Self::Sev4 => 4,
            Self::Sev5 => 5,
        };
        write!(f, "SEV-{n}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CasePriority {
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl std::fmt::Display for CasePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub escalation_id: String,
    /// Id assigned by the ticketing backend
    pub external_id: String,
    pub rule: String,
    pub severity: IncidentSeverity,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    /// Sequence number of the audit event that tripped the rule
    pub source_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub escalation_id: String,
    pub external_id: String,
    pub rule: String,
    pub priority: CasePriority,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub source_seq: u64,
    /// `external_id` of the linked incident
    pub incident_id: String,
}
