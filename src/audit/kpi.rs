//! KPI roll-up computed from audit events alone.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{AuditEvent, AuditKind, Stage};

/// Delivery counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Operational summary for dashboards and the health surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KpiSummary {
    pub total_events: u64,
    pub by_kind: BTreeMap<AuditKind, u64>,
    /// Clips per terminal state
    pub clips: BTreeMap<String, u64>,
    pub actions: ActionCounts,
    /// sent / (sent + failed)
    pub action_success_rate: Option<f64>,
    /// Model outputs that parsed / model outputs received
    pub parse_integrity_rate: Option<f64>,
    /// p95 of completed stage latency
    pub stage_p95_ms: BTreeMap<Stage, u64>,
    /// p95 of intake-to-terminal latency across finished clips
    pub end_to_end_p95_ms: Option<u64>,
    pub stage_timeouts: u64,
    pub tool_errors: u64,
    pub security_events: u64,
    pub degradations: u64,
    pub incidents: u64,
    pub cases: u64,
}

impl KpiSummary {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a AuditEvent>) -> Self {
        let mut kpi = Self::default();
        let mut latencies: BTreeMap<Stage, Vec<u64>> = BTreeMap::new();
        let mut end_to_end: Vec<u64> = Vec::new();
        let mut model_completes = 0u64;

        for event in events {
            kpi.total_events += 1;
            *kpi.by_kind.entry(event.kind).or_insert(0) += 1;

            if event.is_terminal() {
                let state = event.payload_str("state").unwrap_or("unknown").to_string();
                *kpi.clips.entry(state).or_insert(0) += 1;
                if let Some(ms) = event.payload_u64("clip_elapsed_ms") {
                    end_to_end.push(ms);
                }
            }

            match event.kind {
                AuditKind::StageComplete => {
                    if let (Some(stage), Some(ms)) = (event.stage, event.payload_u64("elapsed_ms")) {
                        latencies.entry(stage).or_default().push(ms);
                    }
                    model_completes += 1;
                }
                AuditKind::ActionSent => kpi.actions.sent += 1,
                AuditKind::ActionFailed => kpi.actions.failed += 1,
                AuditKind::ActionSkipped => kpi.actions.skipped += 1,
                AuditKind::StageTimeout => kpi.stage_timeouts += 1,
                AuditKind::ToolError => kpi.tool_errors += 1,
                AuditKind::SecurityBlock => kpi.security_events += 1,
                AuditKind::DegradationApplied => kpi.degradations += 1,
                AuditKind::IncidentCreated => kpi.incidents += 1,
                AuditKind::CaseCreated => kpi.cases += 1,
                AuditKind::StageStart | AuditKind::ParseFail => {}
            }
        }

        let delivered = kpi.actions.sent + kpi.actions.failed;
        kpi.action_success_rate = ratio(kpi.actions.sent, delivered);

        let parse_fails = kpi.by_kind.get(&AuditKind::ParseFail).copied().unwrap_or(0);
        kpi.parse_integrity_rate = ratio(model_completes, model_completes + parse_fails);

        kpi.stage_p95_ms = latencies
            .into_iter()
            .map(|(stage, mut samples)| (stage, percentile(&mut samples, 0.95)))
            .collect();
        if !end_to_end.is_empty() {
            kpi.end_to_end_p95_ms = Some(percentile(&mut end_to_end, 0.95));
        }

        kpi
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Nearest-rank percentile. `samples` must be non-empty.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn percentile(samples: &mut [u64], p: f64) -> u64 {
    samples.sort_unstable();
    let rank = (p * samples.len() as f64).ceil() as usize;
    samples[rank.saturating_sub(1).min(samples.len() - 1)]
}
