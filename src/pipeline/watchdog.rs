//! Watchdog - per-invocation deadline timers
//!
//! `arm` spawns one sleeping tokio task per token. When the sleep ends
//! before the token is disarmed the timer fires: it counts an SLO breach and
//! cancels the token's `fired` signal so the owning runner can stop waiting.
//!
//! Firing and disarming race through a single atomic state. Exactly one of
//! them moves the token out of `ARMED`; the loser sees what happened.
//! Dropping a token disarms it.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::Metrics;
use crate::types::Stage;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const DISARMED: u8 = 2;

/// What a timer is watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    Stage(Stage),
    EndToEnd,
}

impl WatchScope {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stage(stage) => stage.as_str(),
            Self::EndToEnd => "end_to_end",
        }
    }
}

/// Result of disarming a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisarmOutcome {
    /// Disarmed before the deadline
    InTime,
    /// The deadline had already fired
    Fired,
}

#[derive(Clone)]
pub struct Watchdog {
    metrics: Arc<Metrics>,
    in_flight: Arc<AtomicUsize>,
}

impl Watchdog {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Timers currently armed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a deadline timer. Must be called inside a tokio runtime.
    pub fn arm(&self, scope: WatchScope, clip_id: &str, deadline: Duration) -> WatchdogToken {
        let state = Arc::new(AtomicU8::new(ARMED));
        let fired = CancellationToken::new();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics
            .set_gauge("watchdog_timers_in_flight", &[], now as f64);

        let timer = {
            let state = Arc::clone(&state);
            let fired = fired.clone();
            let metrics = Arc::clone(&self.metrics);
            let in_flight = Arc::clone(&self.in_flight);
            let clip_id = clip_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if state
                    .compare_exchange(ARMED, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    release(&in_flight, &metrics);
                    metrics.incr("slo_breach_total", &[("stage", scope.label())]);
                    warn!(
                        clip_id = %clip_id,
                        scope = scope.label(),
                        deadline_ms = deadline.as_millis() as u64,
                        "SLO deadline elapsed"
                    );
                    fired.cancel();
                }
            })
        };

        WatchdogToken {
            scope,
            deadline,
            armed_at: Instant::now(),
            state,
            fired,
            timer: Some(timer),
            in_flight: Arc::clone(&self.in_flight),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

fn release(in_flight: &AtomicUsize, metrics: &Metrics) {
    let now = in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    metrics.set_gauge("watchdog_timers_in_flight", &[], now as f64);
}

/// Handle to one armed timer.
pub struct WatchdogToken {
    scope: WatchScope,
    deadline: Duration,
    armed_at: Instant,
    state: Arc<AtomicU8>,
    fired: CancellationToken,
    timer: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl WatchdogToken {
    pub const fn scope(&self) -> WatchScope {
        self.scope
    }

    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Time since the token was armed.
    pub fn elapsed(&self) -> Duration {
        self.armed_at.elapsed()
    }

    /// Resolves once the deadline fires. Never resolves after an in-time disarm.
    pub async fn fired(&self) {
        self.fired.cancelled().await;
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FIRED
    }

    /// Stop the timer. Idempotent: later calls report the first outcome.
    pub fn disarm(&mut self) -> DisarmOutcome {
        let outcome = match self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                release(&self.in_flight, &self.metrics);
                DisarmOutcome::InTime
            }
            Err(FIRED) => DisarmOutcome::Fired,
            Err(_) => DisarmOutcome::InTime,
        };
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        outcome
    }
}

impl Drop for WatchdogToken {
    fn drop(&mut self) {
        self.disarm();
    }
}
