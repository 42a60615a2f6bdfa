//! Escalation Dedup Tests
//!
//! Feeds hand-built audit events with controlled timestamps through the
//! escalator and checks cooldown suppression and key separation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use stagewarden::audit::AuditLog;
use stagewarden::capabilities::{IncidentBackend, MemoryIncidentBackend};
use stagewarden::config::{DedupScope, EscalationConfig, EscalationRule};
use stagewarden::escalation::{Escalation, IncidentEscalator};
use stagewarden::metrics::Metrics;
use stagewarden::types::{AuditDraft, AuditEvent, AuditKind, CasePriority, IncidentSeverity, Stage};

const COOLDOWN_SECS: u64 = 120;

struct Harness {
    escalator: IncidentEscalator,
    backend: Arc<MemoryIncidentBackend>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
}

fn harness(rule: EscalationRule) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLog::in_memory(Arc::clone(&metrics)));
    let backend = Arc::new(MemoryIncidentBackend::new());
    let config = EscalationConfig {
        cooldown_secs: COOLDOWN_SECS,
        rules: vec![rule],
        ..EscalationConfig::default()
    };
    let escalator = IncidentEscalator::new(
        &config,
        Arc::clone(&backend) as Arc<dyn IncidentBackend>,
        Arc::clone(&audit),
        Arc::clone(&metrics),
    );
    Harness {
        escalator,
        backend,
        audit,
        metrics,
    }
}

fn dispatcher_rule(scope: DedupScope) -> EscalationRule {
    EscalationRule {
        name: "dispatcher_failure".to_string(),
        kind: AuditKind::ActionFailed,
        threshold: 1,
        window_secs: 60,
        scope,
        stage: Some(Stage::Dispatcher),
        severity: IncidentSeverity::Sev2,
        case_priority: CasePriority::P2,
    }
}

fn failed(seq: u64, clip: &str, at: DateTime<Utc>) -> AuditEvent {
    AuditEvent {
        seq,
        timestamp: at,
        kind: AuditKind::ActionFailed,
        clip_id: Some(clip.to_string()),
        stage: Some(Stage::Dispatcher),
        payload: json!({"reason": "dispatcher_outage", "terminal": true, "state": "failed"}),
    }
}

#[tokio::test]
async fn burst_within_cooldown_opens_exactly_one_incident() {
    let h = harness(dispatcher_rule(DedupScope::Stage));
    let t0 = Utc::now();

    let mut created = 0;
    let mut suppressed = 0;
    for seq in 1..=10 {
        let at = t0 + Duration::seconds(seq as i64);
        for result in h.escalator.observe(&failed(seq, &format!("clip-{seq}"), at)).await.unwrap() {
            match result {
                Escalation::Created { .. } => created += 1,
                Escalation::Suppressed { .. } => suppressed += 1,
                Escalation::BackendFailed { .. } => panic!("backend should not fail"),
            }
        }
    }

    assert_eq!(created, 1);
    assert_eq!(suppressed, 9);
    assert_eq!(h.escalator.incidents().len(), 1);
    assert_eq!(h.escalator.cases().len(), 1);
    assert_eq!(h.backend.incidents().len(), 1);
    assert_eq!(
        h.metrics
            .counter("escalations_total", &[("rule", "dispatcher_failure"), ("result", "suppressed")]),
        9
    );
}

#[tokio::test]
async fn event_after_cooldown_opens_a_second_distinct_incident() {
    let h = harness(dispatcher_rule(DedupScope::Stage));
    let t0 = Utc::now();

    h.escalator.observe(&failed(1, "clip-a", t0)).await.unwrap();
    h.escalator
        .observe(&failed(2, "clip-b", t0 + Duration::seconds(30)))
        .await
        .unwrap();
    assert_eq!(h.escalator.incidents().len(), 1);

    let later = t0 + Duration::seconds(COOLDOWN_SECS as i64 + 1);
    h.escalator.observe(&failed(3, "clip-c", later)).await.unwrap();

    let incidents = h.escalator.incidents();
    assert_eq!(incidents.len(), 2);
    assert_ne!(incidents[0].external_id, incidents[1].external_id);
    assert_ne!(incidents[0].escalation_id, incidents[1].escalation_id);
    assert_eq!(incidents[0].dedup_key, incidents[1].dedup_key);

    let cases = h.escalator.cases();
    assert_eq!(cases.len(), 2);
    assert_eq!(cases[1].incident_id, incidents[1].external_id);
}

#[tokio::test]
async fn clip_scope_keys_each_clip_separately() {
    let h = harness(dispatcher_rule(DedupScope::Clip));
    let t0 = Utc::now();

    h.escalator.observe(&failed(1, "clip-a", t0)).await.unwrap();
    h.escalator.observe(&failed(2, "clip-b", t0)).await.unwrap();
    h.escalator.observe(&failed(3, "clip-a", t0)).await.unwrap();

    let keys: Vec<String> = h.escalator.incidents().into_iter().map(|i| i.dedup_key).collect();
    assert_eq!(keys, vec!["dispatcher_failure:clip-a", "dispatcher_failure:clip-b"]);
}

#[tokio::test]
async fn catch_up_reads_the_log_once() {
    let h = harness(dispatcher_rule(DedupScope::Global));
    for clip in ["clip-a", "clip-b", "clip-c"] {
        h.audit
            .append(
                AuditDraft::new(AuditKind::ActionFailed)
                    .clip(clip)
                    .stage(Stage::Dispatcher)
                    .payload(json!({"reason": "retries_exhausted"}))
                    .terminal("failed"),
            )
            .unwrap();
    }

    let consumed = h.escalator.catch_up().await.unwrap();
    assert_eq!(consumed, 3);
    assert_eq!(h.escalator.checkpoint(), 3);

    // incident_created + case_created were appended after the checkpoint
    // and are skipped on the next pass.
    h.escalator.catch_up().await.unwrap();
    assert_eq!(h.escalator.incidents().len(), 1);
    assert_eq!(h.audit.last_seq().unwrap(), 5);
}

#[tokio::test]
async fn run_loop_consumes_broadcast_until_cancelled() {
    let h = harness(dispatcher_rule(DedupScope::Global));
    let escalator = Arc::new(h.escalator);
    let cancel = tokio_util::sync::CancellationToken::new();

    let task = {
        let escalator = Arc::clone(&escalator);
        let cancel = cancel.clone();
        tokio::spawn(async move { escalator.run(cancel).await })
    };

    tokio::task::yield_now().await;
    h.audit
        .append(
            AuditDraft::new(AuditKind::ActionFailed)
                .clip("clip-z")
                .stage(Stage::Dispatcher)
                .terminal("failed"),
        )
        .unwrap();

    for _ in 0..100 {
        if !escalator.incidents().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(escalator.incidents().len(), 1);

    cancel.cancel();
    task.await.unwrap().unwrap();
}
