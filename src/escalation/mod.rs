//! Incident Escalator - audit events to incident and case records
//!
//! Consumes the audit stream, counts events per rule inside a sliding
//! window, and when a rule trips creates an incident plus a linked case
//! through the [`IncidentBackend`]. A dedup key derived from the rule and
//! its scope (stage, clip or global) suppresses further incidents while the
//! key's cooldown runs.
//!
//! Windows and cooldowns are measured on event timestamps, so replaying the
//! same events produces the same escalations.
//!
//! ## Delivery
//!
//! `run` consumes the log's broadcast channel. When the channel lags, the
//! escalator re-reads the log from its checkpoint sequence number. Events
//! at or below the checkpoint are ignored, so a replayed event is never
//! counted twice.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditError, AuditFilter, AuditLog};
use crate::capabilities::IncidentBackend;
use crate::config::{DedupScope, EscalationConfig, EscalationRule};
use crate::metrics::Metrics;
use crate::types::{AuditDraft, AuditEvent, AuditKind, CaseRecord, IncidentRecord};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    /// A backend call for this key is in progress
    Reserved,
    /// An incident is open until the cooldown ends
    Open { until: DateTime<Utc> },
}

#[derive(Default)]
struct EscalatorState {
    /// (rule, dedup key) -> timestamps of qualifying events inside the window
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    open: HashMap<String, KeyState>,
    checkpoint: u64,
    incidents: Vec<IncidentRecord>,
    cases: Vec<CaseRecord>,
}

/// What `observe` did for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Incident (and case, if the backend accepted it) created
    Created { incident_id: String, case_id: Option<String> },
    /// Key open within its cooldown
    Suppressed { dedup_key: String },
    /// Backend call failed; the key was released
    BackendFailed { dedup_key: String, error: String },
}

pub struct IncidentEscalator {
    rules: Vec<EscalationRule>,
    cooldown: ChronoDuration,
    /// Longest rule window; hit lists older than this are dropped
    max_window: ChronoDuration,
    backend: Arc<dyn IncidentBackend>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    state: Mutex<EscalatorState>,
}

impl IncidentEscalator {
    pub fn new(
        config: &EscalationConfig,
        backend: Arc<dyn IncidentBackend>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let max_window = config.rules.iter().map(|r| r.window_secs).max().unwrap_or(0);
        Self {
            rules: config.rules.clone(),
            cooldown: ChronoDuration::seconds(config.cooldown_secs as i64),
            max_window: ChronoDuration::seconds(max_window as i64),
            backend,
            audit,
            metrics,
            state: Mutex::new(EscalatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EscalatorState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn incidents(&self) -> Vec<IncidentRecord> {
        self.lock().incidents.clone()
    }

    pub fn cases(&self) -> Vec<CaseRecord> {
        self.lock().cases.clone()
    }

    /// Highest sequence number consumed.
    pub fn checkpoint(&self) -> u64 {
        self.lock().checkpoint
    }

    /// Consume the audit stream until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AuditError> {
        let mut rx = self.audit.subscribe();
        self.catch_up().await?;
        info!(rules = self.rules.len(), "[Escalator] Watching audit stream");

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break,
                msg = rx.recv() => msg,
            };
            match msg {
                Ok(event) => {
                    self.observe(&event).await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "[Escalator] Audit stream lagged, polling from checkpoint");
                    self.catch_up().await?;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(checkpoint = self.checkpoint(), "[Escalator] Stopped");
        Ok(())
    }

    /// Read every event after the checkpoint straight from the log.
    pub async fn catch_up(&self) -> Result<usize, AuditError> {
        let after = self.checkpoint();
        let events = self.audit.events(AuditFilter::default().after(after))?;
        let n = events.len();
        for event in &events {
            self.observe(event).await?;
        }
        if n > 0 {
            debug!(after, consumed = n, "[Escalator] Caught up from log");
        }
        Ok(n)
    }

    /// Feed one event through every matching rule.
    pub async fn observe(&self, event: &AuditEvent) -> Result<Vec<Escalation>, AuditError> {
        if matches!(event.kind, AuditKind::IncidentCreated | AuditKind::CaseCreated) {
            return Ok(Vec::new());
        }

        let mut tripped = Vec::new();
        {
            let mut state = self.lock();
            if event.seq <= state.checkpoint {
                return Ok(Vec::new());
            }
            state.checkpoint = event.seq;
            self.prune(&mut state, event.timestamp);

            for rule in self.rules.iter().filter(|r| Self::applies(r, event)) {
                let key = dedup_key(rule, event);
                let window = ChronoDuration::seconds(rule.window_secs as i64);
                let hits = state.windows.entry(key.clone()).or_default();
                hits.push_back(event.timestamp);
                while hits.front().is_some_and(|t| *t <= event.timestamp - window) {
                    hits.pop_front();
                }
                if hits.len() < rule.threshold as usize {
                    continue;
                }

                let suppressed = match state.open.get(&key) {
                    Some(KeyState::Reserved) => true,
                    Some(KeyState::Open { until }) => event.timestamp < *until,
                    None => false,
                };
                if suppressed {
                    tripped.push(Err(key));
                } else {
                    state.open.insert(key.clone(), KeyState::Reserved);
                    state.windows.remove(&key);
                    tripped.push(Ok((rule, key)));
                }
            }
        }

        let mut results = Vec::with_capacity(tripped.len());
        for entry in tripped {
            match entry {
                Err(dedup_key) => {
                    self.metrics
                        .incr("escalations_total", &[("rule", rule_of(&dedup_key)), ("result", "suppressed")]);
                    debug!(dedup_key = %dedup_key, seq = event.seq, "[Escalator] Suppressed within cooldown");
                    results.push(Escalation::Suppressed { dedup_key });
                }
                Ok((rule, dedup_key)) => {
                    results.push(self.escalate(rule, dedup_key, event).await?);
                }
            }
        }
        Ok(results)
    }

    /// Forget hit lists that have aged out of every window and keys whose
    /// cooldown has ended. Keeps per-clip keys from accumulating.
    fn prune(&self, state: &mut EscalatorState, now: DateTime<Utc>) {
        let horizon = now - self.max_window;
        state.windows.retain(|_, hits| hits.back().is_some_and(|t| *t > horizon));
        state.open.retain(|_, key| match key {
            KeyState::Reserved => true,
            KeyState::Open { until } => *until > now,
        });
    }

    fn applies(rule: &EscalationRule, event: &AuditEvent) -> bool {
        rule.kind == event.kind && rule.stage.map_or(true, |s| event.stage == Some(s))
    }

    async fn escalate(
        &self,
        rule: &EscalationRule,
        dedup_key: String,
        event: &AuditEvent,
    ) -> Result<Escalation, AuditError> {
        let summary = format!(
            "{}: {} on {} (audit seq {})",
            rule.name,
            event.kind,
            event
                .stage
                .map_or_else(|| "pipeline".to_string(), |s| s.to_string()),
            event.seq
        );

        let incident_id = match self.backend.create_incident(rule.severity, &summary).await {
            Ok(id) => id,
            Err(e) => {
                self.lock().open.remove(&dedup_key);
                self.metrics
                    .incr("escalations_total", &[("rule", rule.name.as_str()), ("result", "failed")]);
                warn!(rule = %rule.name, dedup_key = %dedup_key, error = %e, "[Escalator] Incident creation failed, key released");
                return Ok(Escalation::BackendFailed {
                    dedup_key,
                    error: e.to_string(),
                });
            }
        };

        let escalation_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let incident = IncidentRecord {
            escalation_id: escalation_id.clone(),
            external_id: incident_id.clone(),
            rule: rule.name.clone(),
            severity: rule.severity,
            dedup_key: dedup_key.clone(),
            created_at: now,
            source_seq: event.seq,
        };
        {
            let mut state = self.lock();
            state.open.insert(
                dedup_key.clone(),
                KeyState::Open {
                    until: event.timestamp + self.cooldown,
                },
            );
            state.incidents.push(incident.clone());
        }
        self.audit.append(AuditDraft::new(AuditKind::IncidentCreated).payload(json!({
            "incident": incident,
            "source_kind": event.kind,
            "source_clip_id": event.clip_id,
        })))?;
        self.metrics
            .incr("escalations_total", &[("rule", rule.name.as_str()), ("result", "created")]);
        warn!(
            rule = %rule.name,
            severity = %rule.severity,
            incident_id = %incident_id,
            dedup_key = %dedup_key,
            "[Escalator] Incident opened"
        );

        let case_id = match self
            .backend
            .create_case(rule.case_priority, &summary, &incident_id)
            .await
        {
            Ok(case_id) => {
                let case = CaseRecord {
                    escalation_id,
                    external_id: case_id.clone(),
                    rule: rule.name.clone(),
                    priority: rule.case_priority,
                    dedup_key,
                    created_at: Utc::now(),
                    source_seq: event.seq,
                    incident_id: incident_id.clone(),
                };
                self.lock().cases.push(case.clone());
                self.audit.append(AuditDraft::new(AuditKind::CaseCreated).payload(json!({
                    "case": case,
                    "source_clip_id": event.clip_id,
                })))?;
                Some(case_id)
            }
            Err(e) => {
                warn!(rule = %rule.name, incident_id = %incident_id, error = %e, "[Escalator] Case creation failed");
                None
            }
        };

        Ok(Escalation::Created { incident_id, case_id })
    }
}

fn dedup_key(rule: &EscalationRule, event: &AuditEvent) -> String {
    match rule.scope {
        DedupScope::Global => rule.name.clone(),
        DedupScope::Stage => format!(
            "{}:{}",
            rule.name,
            event.stage.map_or("pipeline", |s| s.as_str())
        ),
        DedupScope::Clip => format!("{}:{}", rule.name, event.clip_id.as_deref().unwrap_or("-")),
    }
}

fn rule_of(dedup_key: &str) -> &str {
    dedup_key.split(':').next().unwrap_or(dedup_key)
}
