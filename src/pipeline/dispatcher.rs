//! Dispatcher - bounded-retry delivery of a final action
//!
//! Each action ends in exactly one of `action_sent`, `action_failed` or
//! `action_skipped`, however many attempts it took. Transient failures back
//! off exponentially (`base * 2^n`, capped, plus jitter); a permanent
//! failure stops immediately. An attempt that outlives the dispatcher
//! deadline counts as transient.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::watchdog::WatchdogToken;
use crate::audit::{AuditError, AuditLog};
use crate::capabilities::{ActionExecutor, ExecOutcome};
use crate::config::DispatcherConfig;
use crate::faults::FaultInjector;
use crate::metrics::Metrics;
use crate::types::{Action, ActionType, AuditDraft, AuditKind, Stage};

/// Why an action was not delivered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Same dedup key delivered within the dedup window
    Duplicate,
    /// Action type `none`
    NoopAction,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NoopAction => "noop_action",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchResult {
    Sent { attempts: u32, reference: Option<String> },
    Failed { attempts: u32, reason: String },
    Skipped { reason: SkipReason },
    /// The clip's end-to-end deadline expired mid-delivery
    Abandoned { attempts: u32 },
}

/// State of a dedup key between reservation and expiry.
#[derive(Debug, Clone, Copy)]
enum DedupSlot {
    /// A delivery for this key is in progress
    InFlight,
    Delivered(Instant),
}

pub struct Dispatcher {
    executor: Arc<dyn ActionExecutor>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    faults: Arc<FaultInjector>,
    config: DispatcherConfig,
    attempt_deadline: Duration,
    /// Dedup key -> in-flight reservation or last successful delivery
    delivered: Mutex<HashMap<String, DedupSlot>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        attempt_deadline: Duration,
        executor: Arc<dyn ActionExecutor>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        faults: Arc<FaultInjector>,
    ) -> Self {
        Self {
            executor,
            audit,
            metrics,
            faults,
            config,
            attempt_deadline,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver with no outer deadline.
    pub async fn deliver(&self, clip_id: &str, action: &Action, dedup_key: &str) -> Result<DispatchResult, AuditError> {
        self.deliver_inner(clip_id, action, dedup_key, None).await
    }

    /// Deliver, giving up when the clip's end-to-end deadline fires.
    pub async fn deliver_within(
        &self,
        clip_id: &str,
        action: &Action,
        dedup_key: &str,
        end_to_end: &WatchdogToken,
    ) -> Result<DispatchResult, AuditError> {
        self.deliver_inner(clip_id, action, dedup_key, Some(end_to_end)).await
    }

    async fn deliver_inner(
        &self,
        clip_id: &str,
        action: &Action,
        dedup_key: &str,
        end_to_end: Option<&WatchdogToken>,
    ) -> Result<DispatchResult, AuditError> {
        let result = match self.reserve(action, dedup_key) {
            Err(reason) => DispatchResult::Skipped { reason },
            Ok(reservation) => {
                let result = self.attempt_all(clip_id, action, end_to_end).await;
                if matches!(result, DispatchResult::Sent { .. }) {
                    reservation.mark_delivered();
                }
                result
            }
        };
        let draft = Self::record(clip_id, action, dedup_key, &result);
        let draft = match end_to_end {
            Some(token) => draft.clip_elapsed(token.elapsed()),
            None => draft,
        };
        self.audit.append(draft.clip(clip_id).stage(Stage::Dispatcher))?;
        Ok(result)
    }

    async fn attempt_all(&self, clip_id: &str, action: &Action, end_to_end: Option<&WatchdogToken>) -> DispatchResult {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.backoff(attempts);
                self.metrics.incr("dispatch_retries_total", &[]);
                debug!(clip_id = %clip_id, attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Retrying dispatch");
                if until_deadline(tokio::time::sleep(delay), end_to_end).await.is_none() {
                    return DispatchResult::Abandoned { attempts };
                }
            }
            attempts += 1;

            let Some(outcome) = until_deadline(self.attempt(action), end_to_end).await else {
                return DispatchResult::Abandoned { attempts };
            };
            match outcome {
                ExecOutcome::Ok(reference) => {
                    self.metrics.incr("dispatch_attempts_total", &[("outcome", "ok")]);
                    return DispatchResult::Sent { attempts, reference };
                }
                ExecOutcome::Permanent(reason) => {
                    self.metrics.incr("dispatch_attempts_total", &[("outcome", "permanent")]);
                    warn!(clip_id = %clip_id, attempt = attempts, reason = %reason, "Dispatch failed permanently");
                    return DispatchResult::Failed { attempts, reason };
                }
                ExecOutcome::Transient(reason) => {
                    self.metrics.incr("dispatch_attempts_total", &[("outcome", "transient")]);
                    warn!(clip_id = %clip_id, attempt = attempts, reason = %reason, "Dispatch attempt failed");
                    last_error = reason;
                }
            }
        }

        DispatchResult::Failed {
            attempts,
            reason: format!("retries exhausted: {last_error}"),
        }
    }

    async fn attempt(&self, action: &Action) -> ExecOutcome {
        if self.faults.dispatcher_outage() {
            return ExecOutcome::Permanent("dispatcher_outage fault active".to_string());
        }
        match tokio::time::timeout(self.attempt_deadline, self.executor.execute(action)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecOutcome::Transient(format!(
                "attempt exceeded {}ms deadline",
                self.attempt_deadline.as_millis()
            )),
        }
    }

    /// Delay before retry number `retry` (1-based).
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.base_backoff_ms;
        let exp = base.saturating_mul(1_u64 << retry.saturating_sub(1).min(20));
        let capped = exp.min(self.config.max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, DedupSlot>> {
        self.delivered.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check-and-set on the dedup key.
    fn reserve<'a>(&'a self, action: &Action, dedup_key: &'a str) -> Result<Reservation<'a>, SkipReason> {
        if action.action_type == ActionType::None {
            return Err(SkipReason::NoopAction);
        }
        let window = Duration::from_secs(self.config.dedup_window_secs);
        let mut slots = self.slots();
        slots.retain(|_, slot| match slot {
            DedupSlot::InFlight => true,
            DedupSlot::Delivered(at) => at.elapsed() < window,
        });
        if slots.contains_key(dedup_key) {
            return Err(SkipReason::Duplicate);
        }
        slots.insert(dedup_key.to_string(), DedupSlot::InFlight);
        Ok(Reservation {
            dispatcher: self,
            dedup_key,
            delivered: false,
        })
    }

    fn record(clip_id: &str, action: &Action, dedup_key: &str, result: &DispatchResult) -> AuditDraft {
        match result {
            DispatchResult::Sent { attempts, reference } => {
                info!(clip_id = %clip_id, action = %action.action_type, target = %action.target, attempts, "Action sent");
                AuditDraft::new(AuditKind::ActionSent)
                    .payload(json!({
                        "action_type": action.action_type,
                        "target": action.target,
                        "priority": action.priority,
                        "dedup_key": dedup_key,
                        "attempts": attempts,
                        "reference": reference,
                    }))
                    .terminal("dispatched")
            }
            DispatchResult::Failed { attempts, reason } => AuditDraft::new(AuditKind::ActionFailed)
                .payload(json!({
                    "action_type": action.action_type,
                    "dedup_key": dedup_key,
                    "attempts": attempts,
                    "reason": reason,
                }))
                .terminal("failed"),
            DispatchResult::Skipped { reason } => {
                info!(clip_id = %clip_id, reason = reason.as_str(), "Action skipped");
                AuditDraft::new(AuditKind::ActionSkipped)
                    .payload(json!({
                        "action_type": action.action_type,
                        "dedup_key": dedup_key,
                        "reason": reason,
                    }))
                    .terminal("skipped")
            }
            DispatchResult::Abandoned { attempts } => {
                warn!(clip_id = %clip_id, attempts, "End-to-end deadline expired during dispatch");
                AuditDraft::new(AuditKind::ActionFailed)
                    .payload(json!({
                        "action_type": action.action_type,
                        "dedup_key": dedup_key,
                        "attempts": attempts,
                        "reason": "end_to_end_deadline",
                    }))
                    .terminal("timed_out")
            }
        }
    }
}

/// Holds a dedup key while its delivery runs. Dropped without
/// [`mark_delivered`](Self::mark_delivered), it releases the key so a later
/// clip can retry.
struct Reservation<'a> {
    dispatcher: &'a Dispatcher,
    dedup_key: &'a str,
    delivered: bool,
}

impl Reservation<'_> {
    fn mark_delivered(mut self) {
        self.dispatcher
            .slots()
            .insert(self.dedup_key.to_string(), DedupSlot::Delivered(Instant::now()));
        self.delivered = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.delivered {
            self.dispatcher.slots().remove(self.dedup_key);
        }
    }
}

async fn until_deadline<F: Future>(fut: F, end_to_end: Option<&WatchdogToken>) -> Option<F::Output> {
    match end_to_end {
        Some(token) => tokio::select! {
            out = fut => Some(out),
            () = token.fired() => None,
        },
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::pipeline::watchdog::{WatchScope, Watchdog};
    use crate::types::Priority;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        outcome: ExecOutcome,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionExecutor for Scripted {
        async fn execute(&self, _: &Action) -> ExecOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn action(action_type: ActionType) -> Action {
        Action {
            action_type,
            target: "cam-1".to_string(),
            operator_message: "walkway_violation detected".to_string(),
            steps: vec!["Send an alert".to_string()],
            priority: Priority::P2,
            notes: vec![],
        }
    }

    fn dispatcher(outcome: ExecOutcome) -> (Dispatcher, Arc<Scripted>, Arc<AuditLog>, Arc<FaultInjector>) {
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditLog::in_memory(Arc::clone(&metrics)));
        let faults = Arc::new(FaultInjector::new(Arc::clone(&metrics)));
        let executor = Arc::new(Scripted {
            outcome,
            calls: AtomicU32::new(0),
        });
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            Duration::from_millis(1_200),
            Arc::clone(&executor) as Arc<dyn ActionExecutor>,
            Arc::clone(&audit),
            metrics,
            Arc::clone(&faults),
        );
        (d, executor, audit, faults)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sent_first_try() {
        let (d, exec, audit, _) = dispatcher(ExecOutcome::Ok(None));
        let res = d.deliver("c1", &action(ActionType::Alert), "k").await.unwrap();
        assert_eq!(res, DispatchResult::Sent { attempts: 1, reference: None });
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        let events = audit.events(AuditFilter::default()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::ActionSent);
        assert_eq!(events[0].stage, Some(Stage::Dispatcher));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_stops_retrying() {
        let (d, exec, _, _) = dispatcher(ExecOutcome::Permanent("400".to_string()));
        let res = d.deliver("c1", &action(ActionType::Alert), "k").await.unwrap();
        assert!(matches!(res, DispatchResult::Failed { attempts: 1, .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_fails_without_calling_executor() {
        let (d, exec, audit, faults) = dispatcher(ExecOutcome::Ok(None));
        faults.activate(crate::faults::FaultScenario::DispatcherOutage);
        let res = d.deliver("c1", &action(ActionType::StopLine), "k").await.unwrap();
        assert!(matches!(res, DispatchResult::Failed { attempts: 1, .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        let failed = audit
            .events(AuditFilter::default().kinds([AuditKind::ActionFailed]))
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_and_duplicate_skipped() {
        let (d, exec, _, _) = dispatcher(ExecOutcome::Ok(None));
        let res = d.deliver("c1", &action(ActionType::None), "k0").await.unwrap();
        assert_eq!(res, DispatchResult::Skipped { reason: SkipReason::NoopAction });

        d.deliver("c2", &action(ActionType::Alert), "cam-1:walkway:alert").await.unwrap();
        let res = d.deliver("c3", &action(ActionType::Alert), "cam-1:walkway:alert").await.unwrap();
        assert_eq!(res, DispatchResult::Skipped { reason: SkipReason::Duplicate });
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        // window expires
        tokio::time::advance(Duration::from_secs(21)).await;
        let res = d.deliver("c4", &action(ActionType::Alert), "cam-1:walkway:alert").await.unwrap();
        assert!(matches!(res, DispatchResult::Sent { .. }));
    }

    struct Slow {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionExecutor for Slow {
        async fn execute(&self, _: &Action) -> ExecOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            ExecOutcome::Ok(None)
        }
    }

    fn slow_dispatcher() -> (Dispatcher, Arc<Slow>) {
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditLog::in_memory(Arc::clone(&metrics)));
        let faults = Arc::new(FaultInjector::new(Arc::clone(&metrics)));
        let exec = Arc::new(Slow { calls: AtomicU32::new(0) });
        let d = Dispatcher::new(
            DispatcherConfig::default(),
            Duration::from_millis(1_200),
            Arc::clone(&exec) as Arc<dyn ActionExecutor>,
            audit,
            metrics,
            faults,
        );
        (d, exec)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_key_delivers_once() {
        let (d, exec) = slow_dispatcher();
        let a = action(ActionType::Page);

        let (r1, r2) = tokio::join!(
            d.deliver("c1", &a, "cam-1:walkway:page"),
            d.deliver("c2", &a, "cam-1:walkway:page"),
        );
        let mut results = vec![r1.unwrap(), r2.unwrap()];
        results.sort_by_key(|r| matches!(r, DispatchResult::Sent { .. }));
        assert_eq!(results[0], DispatchResult::Skipped { reason: SkipReason::Duplicate });
        assert!(matches!(results[1], DispatchResult::Sent { attempts: 1, .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_delivery_releases_key() {
        let (d, exec) = slow_dispatcher();
        let a = action(ActionType::Page);
        let cut_short = tokio::time::timeout(
            Duration::from_millis(10),
            d.deliver("c1", &a, "cam-1:walkway:page"),
        )
        .await;
        assert!(cut_short.is_err());

        let res = d.deliver("c2", &a, "cam-1:walkway:page").await.unwrap();
        assert!(matches!(res, DispatchResult::Sent { .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_releases_key() {
        let (d, exec, _, _) = dispatcher(ExecOutcome::Permanent("400".to_string()));
        let a = action(ActionType::Alert);
        let first = d.deliver("c1", &a, "cam-1:walkway:alert").await.unwrap();
        assert!(matches!(first, DispatchResult::Failed { .. }));
        let second = d.deliver("c2", &a, "cam-1:walkway:alert").await.unwrap();
        assert!(matches!(second, DispatchResult::Failed { .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_backoff() {
        let (d, _, audit, _) = dispatcher(ExecOutcome::Transient("503".to_string()));
        let wd = Watchdog::new(Arc::new(Metrics::new()));
        let e2e = wd.arm(WatchScope::EndToEnd, "c1", Duration::from_millis(100));
        let res = d
            .deliver_within("c1", &action(ActionType::Alert), "k", &e2e)
            .await
            .unwrap();
        assert_eq!(res, DispatchResult::Abandoned { attempts: 1 });
        let events = audit.events(AuditFilter::default()).unwrap();
        assert_eq!(events[0].payload_str("state"), Some("timed_out"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let (d, _, _, _) = dispatcher(ExecOutcome::Ok(None));
        for retry in 1..10 {
            let delay = d.backoff(retry).as_millis() as u64;
            let expected = (200_u64 << (retry - 1)).min(2_000);
            assert!(delay >= expected && delay <= expected + expected / 4);
        }
    }
}
