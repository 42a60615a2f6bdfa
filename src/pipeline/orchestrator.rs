//! Orchestrator - the per-clip state machine
//!
//! ```text
//! Queued -> Observing -> Thinking -> Acting -> Dispatched | Skipped | Failed | TimedOut
//! ```
//!
//! A stage failure ends the run at once: a timeout goes to `TimedOut`;
//! a tool error, parse failure or security block goes to `Failed`. An
//! end-to-end timer armed at clip start runs alongside the stage timers and
//! forces `TimedOut` wherever the clip is when it fires. Every run writes
//! exactly one terminal audit event before `run_clip` returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use super::degradation::DegradationPolicy;
use super::dispatcher::{DispatchResult, Dispatcher};
use super::guard::InputGuard;
use super::stage_runner::{StageCall, StageFailure, StageRunner, TimeoutScope};
use super::triggers;
use super::watchdog::{WatchScope, Watchdog, WatchdogToken};
use crate::audit::{AuditError, AuditLog};
use crate::capabilities::Capabilities;
use crate::config::defaults::INJECTED_INSTRUCTION;
use crate::config::PipelineConfig;
use crate::faults::FaultInjector;
use crate::metrics::Metrics;
use crate::types::{
    Action, AuditDraft, AuditKind, Clip, Decision, DoerOutput, Observation, ObserverOutput, Stage,
    ThinkerOutput,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipState {
    Queued,
    Observing,
    Thinking,
    Acting,
    Dispatched,
    Skipped,
    Failed,
    TimedOut,
}

impl ClipState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Observing => "observing",
            Self::Thinking => "thinking",
            Self::Acting => "acting",
            Self::Dispatched => "dispatched",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dispatched | Self::Skipped | Self::Failed | Self::TimedOut)
    }

    const fn after_failure(failure: &StageFailure) -> Self {
        if failure.is_timeout() {
            Self::TimedOut
        } else {
            Self::Failed
        }
    }

    const fn after_dispatch(result: &DispatchResult) -> Self {
        match result {
            DispatchResult::Sent { .. } => Self::Dispatched,
            DispatchResult::Failed { .. } => Self::Failed,
            DispatchResult::Skipped { .. } => Self::Skipped,
            DispatchResult::Abandoned { .. } => Self::TimedOut,
        }
    }
}

impl std::fmt::Display for ClipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of one clip's run.
#[derive(Debug, Clone, Serialize)]
pub struct ClipOutcome {
    pub clip_id: String,
    pub state: ClipState,
    pub decision: Option<Decision>,
    pub action: Option<Action>,
    pub dispatch: Option<DispatchResult>,
    pub failure: Option<StageFailure>,
    pub elapsed_ms: u64,
}

impl ClipOutcome {
    fn new(clip_id: &str) -> Self {
        Self {
            clip_id: clip_id.to_string(),
            state: ClipState::Queued,
            decision: None,
            action: None,
            dispatch: None,
            failure: None,
            elapsed_ms: 0,
        }
    }

    fn failed(mut self, failure: StageFailure) -> Self {
        self.state = ClipState::after_failure(&failure);
        self.failure = Some(failure);
        self
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    config: PipelineConfig,
    capabilities: Capabilities,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    faults: Arc<FaultInjector>,
    watchdog: Watchdog,
    runner: StageRunner,
    policy: DegradationPolicy,
    dispatcher: Dispatcher,
    in_flight: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        capabilities: Capabilities,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        faults: Arc<FaultInjector>,
    ) -> anyhow::Result<Self> {
        let watchdog = Watchdog::new(Arc::clone(&metrics));
        let runner = StageRunner::new(
            config.slo.clone(),
            Arc::clone(&audit),
            Arc::clone(&metrics),
            watchdog.clone(),
            Arc::clone(&faults),
            InputGuard::new()?,
        );
        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            config.slo.deadline(Stage::Dispatcher),
            Arc::clone(&capabilities.executor),
            Arc::clone(&audit),
            Arc::clone(&metrics),
            Arc::clone(&faults),
        );
        Ok(Self {
            policy: DegradationPolicy::from_config(&config.degradation),
            config,
            capabilities,
            audit,
            metrics,
            faults,
            watchdog,
            runner,
            dispatcher,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Clips currently inside `run_clip`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one clip to a terminal state. Only audit failures are returned as errors.
    pub async fn run_clip(&self, clip: &Clip) -> Result<ClipOutcome, AuditError> {
        let started = Instant::now();
        self.track(1);

        let end_to_end = self
            .watchdog
            .arm(WatchScope::EndToEnd, &clip.id, self.config.slo.end_to_end());
        let result = self.drive(clip, &end_to_end).await;
        drop(end_to_end);
        self.track(-1);

        let mut outcome = result?;
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;

        self.metrics
            .observe("end_to_end_latency_seconds", &[], outcome.elapsed_ms as f64 / 1_000.0);
        self.metrics
            .incr("clips_total", &[("state", outcome.state.as_str())]);
        info!(
            clip_id = %clip.id,
            source_id = %clip.source_id,
            state = %outcome.state,
            elapsed_ms = outcome.elapsed_ms,
            "Clip complete"
        );
        Ok(outcome)
    }

    fn track(&self, delta: isize) {
        let now = if delta > 0 {
            self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
        };
        self.metrics.set_gauge("clips_in_flight", &[], now as f64);
    }

    async fn drive(&self, clip: &Clip, end_to_end: &WatchdogToken) -> Result<ClipOutcome, AuditError> {
        let mut outcome = ClipOutcome::new(&clip.id);

        // Observing
        outcome.state = ClipState::Observing;
        let call = StageCall::new(Stage::Observer, clip.id.as_str(), json!({ "clip": clip }));
        let observed = match self
            .runner
            .run::<ObserverOutput>(call, &self.capabilities.observer, end_to_end)
            .await?
        {
            Ok(out) => out,
            Err(failure) => return Ok(outcome.failed(failure)),
        };
        let observation = Observation::from_output(clip, observed);

        // Thinking
        outcome.state = ClipState::Thinking;
        if end_to_end.has_fired() {
            return self.expire(outcome, end_to_end, Stage::Thinker);
        }
        let triggered = triggers::evaluate(&observation);
        let query = triggers::lookup_query(&triggered, &observation);
        let lookup = tokio::select! {
            res = self.capabilities.policy.lookup(&query) => Some(res),
            () = end_to_end.fired() => None,
        };
        let citations = match lookup {
            Some(Ok(citations)) => citations,
            Some(Err(e)) => {
                warn!(clip_id = %clip.id, error = %e, "Policy lookup failed, continuing ungrounded");
                Vec::new()
            }
            None => return self.expire(outcome, end_to_end, Stage::Thinker),
        };

        let mut summary = observation.summary.clone();
        if self.faults.prompt_injection() {
            summary = format!("{summary}\n{INJECTED_INSTRUCTION}");
        }
        let input = json!({
            "summary": summary,
            "signals": observation.signals,
            "triggered_rules": triggered.iter().map(|t| t.rule.id).collect::<Vec<_>>(),
            "uncertain": triggered.iter().any(|t| t.uncertain),
            "citations": citations,
        });
        let call = StageCall::new(Stage::Thinker, clip.id.as_str(), input).screened(summary);
        let thought = match self
            .runner
            .run::<ThinkerOutput>(call, &self.capabilities.thinker, end_to_end)
            .await?
        {
            Ok(out) => out,
            Err(failure) => return Ok(outcome.failed(failure)),
        };

        let decision = Decision::from_output(clip, &observation, thought, citations);
        let (decision, downgrade) = self.policy.apply(decision);
        if let Some(d) = downgrade {
            warn!(
                clip_id = %clip.id,
                from = %d.from,
                to = %d.to,
                reason = d.reason.as_str(),
                "Decision degraded"
            );
            self.metrics
                .incr("degradations_total", &[("reason", d.reason.as_str())]);
            self.audit.append(
                AuditDraft::new(AuditKind::DegradationApplied)
                    .clip(clip.id.as_str())
                    .stage(Stage::Thinker)
                    .payload(json!({
                        "from": d.from,
                        "to": d.to,
                        "reason": d.reason,
                        "confidence": decision.confidence,
                        "groundedness": decision.groundedness,
                    })),
            )?;
        }

        if !decision.violation {
            self.audit.append(
                AuditDraft::new(AuditKind::ActionSkipped)
                    .clip(clip.id.as_str())
                    .payload(json!({
                        "reason": "no_violation",
                        "confidence": decision.confidence,
                    }))
                    .terminal(ClipState::Skipped.as_str())
                    .clip_elapsed(end_to_end.elapsed()),
            )?;
            outcome.state = ClipState::Skipped;
            outcome.decision = Some(decision);
            return Ok(outcome);
        }

        // Acting
        outcome.state = ClipState::Acting;
        if end_to_end.has_fired() {
            outcome.decision = Some(decision);
            return self.expire(outcome, end_to_end, Stage::Doer);
        }
        let input = json!({
            "decision": decision,
            "clip_id": clip.id,
            "source_id": clip.source_id,
        });
        let call = StageCall::new(Stage::Doer, clip.id.as_str(), input);
        let planned = match self
            .runner
            .run::<DoerOutput>(call, &self.capabilities.doer, end_to_end)
            .await?
        {
            Ok(out) => out,
            Err(failure) => {
                outcome.decision = Some(decision);
                return Ok(outcome.failed(failure));
            }
        };
        let action = Action::from_output(&decision, planned);

        // Dispatching
        if end_to_end.has_fired() {
            outcome.decision = Some(decision);
            outcome.action = Some(action);
            return self.expire(outcome, end_to_end, Stage::Dispatcher);
        }
        let dedup_key = format!(
            "{}:{}:{}",
            clip.source_id,
            decision.rule_id.as_deref().unwrap_or("none"),
            action.action_type
        );
        let result = self
            .dispatcher
            .deliver_within(&clip.id, &action, &dedup_key, end_to_end)
            .await?;

        outcome.state = ClipState::after_dispatch(&result);
        outcome.decision = Some(decision);
        outcome.action = Some(action);
        outcome.dispatch = Some(result);
        Ok(outcome)
    }

    /// End-to-end deadline expired between stages.
    fn expire(
        &self,
        mut outcome: ClipOutcome,
        end_to_end: &WatchdogToken,
        next: Stage,
    ) -> Result<ClipOutcome, AuditError> {
        warn!(clip_id = %outcome.clip_id, next_stage = %next, "End-to-end deadline expired, skipping remaining stages");
        let deadline_ms = end_to_end.deadline().as_millis() as u64;
        self.audit.append(
            AuditDraft::new(AuditKind::StageTimeout)
                .clip(outcome.clip_id.as_str())
                .payload(json!({
                    "scope": TimeoutScope::EndToEnd,
                    "deadline_ms": deadline_ms,
                    "next_stage": next,
                }))
                .terminal(ClipState::TimedOut.as_str())
                .clip_elapsed(end_to_end.elapsed()),
        )?;
        outcome.state = ClipState::TimedOut;
        outcome.failure = Some(StageFailure::Timeout {
            scope: TimeoutScope::EndToEnd,
            elapsed_ms: deadline_ms,
        });
        Ok(outcome)
    }
}
