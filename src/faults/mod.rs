//! Fault Injector - deterministic, reversible failure scenarios
//!
//! Each scenario targets one component (a stage or the dispatcher) and at
//! most one scenario is active per component. Activating a second scenario
//! for the same component replaces the first.
//!
//! | Scenario            | Component        | Effect                                   |
//! |---------------------|------------------|------------------------------------------|
//! | `dispatcher_outage` | Dispatcher       | every delivery attempt fails permanently |
//! | `slow_stage`        | the named stage  | the stage's call is delayed              |
//! | `prompt_injection`  | Thinker          | malicious text appended to its input     |

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::defaults::LONG_RUNNING_OBSERVER_OVERRUN_MS;
use crate::config::SloConfig;
use crate::metrics::Metrics;
use crate::types::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scenario", rename_all = "snake_case")]
pub enum FaultScenario {
    DispatcherOutage,
    SlowStage { stage: Stage, delay_ms: u64 },
    PromptInjection,
}

impl FaultScenario {
    /// Component this scenario occupies.
    pub const fn component(self) -> Stage {
        match self {
            Self::DispatcherOutage => Stage::Dispatcher,
            Self::SlowStage { stage, .. } => stage,
            Self::PromptInjection => Stage::Thinker,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DispatcherOutage => "dispatcher_outage",
            Self::SlowStage { .. } => "slow_stage",
            Self::PromptInjection => "prompt_injection",
        }
    }

    /// Parse a CLI scenario name.
    ///
    /// Accepts `dispatcher_outage`, `prompt_injection`,
    /// `slow_stage:<stage>:<delay_ms>`, and `long_running_observer`
    /// (the Observer delayed past its deadline).
    pub fn parse(raw: &str, slo: &SloConfig) -> Result<Self, String> {
        let raw = raw.trim();
        match raw {
            "dispatcher_outage" => return Ok(Self::DispatcherOutage),
            "prompt_injection" | "injection" => return Ok(Self::PromptInjection),
            "long_running_observer" => {
                return Ok(Self::SlowStage {
                    stage: Stage::Observer,
                    delay_ms: slo.observer_ms + LONG_RUNNING_OBSERVER_OVERRUN_MS,
                })
            }
            _ => {}
        }

        let mut parts = raw.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("slow_stage"), Some(stage), Some(delay), None) => {
                let stage: Stage = stage.parse()?;
                let delay_ms = delay
                    .parse()
                    .map_err(|_| format!("invalid delay '{delay}' in scenario '{raw}'"))?;
                Ok(Self::SlowStage { stage, delay_ms })
            }
            _ => Err(format!("unknown scenario '{raw}'")),
        }
    }
}

impl std::fmt::Display for FaultScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlowStage { stage, delay_ms } => write!(f, "slow_stage({stage}, {delay_ms}ms)"),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Injector
// ============================================================================

pub struct FaultInjector {
    active: RwLock<BTreeMap<Stage, FaultScenario>>,
    metrics: Arc<Metrics>,
}

impl FaultInjector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            active: RwLock::new(BTreeMap::new()),
            metrics,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Stage, FaultScenario>> {
        self.active.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Stage, FaultScenario>> {
        self.active.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_gauge(&self, scenario: FaultScenario, value: f64) {
        self.metrics.set_gauge(
            "fault_active",
            &[("scenario", scenario.name()), ("component", scenario.component().as_str())],
            value,
        );
    }

    /// Activate a scenario. Returns the scenario it replaced, if any.
    pub fn activate(&self, scenario: FaultScenario) -> Option<FaultScenario> {
        let replaced = self.write().insert(scenario.component(), scenario);
        if let Some(old) = replaced {
            self.set_gauge(old, 0.0);
            warn!(scenario = %scenario, replaced = %old, "Fault scenario replaced");
        } else {
            warn!(scenario = %scenario, component = %scenario.component(), "Fault scenario activated");
        }
        self.set_gauge(scenario, 1.0);
        replaced
    }

    /// Deactivate a scenario if it is the one active on its component.
    ///
    /// Matching is by scenario kind, so any `slow_stage` on the stage is
    /// removed regardless of its delay.
    pub fn deactivate(&self, scenario: FaultScenario) -> bool {
        let mut active = self.write();
        let component = scenario.component();
        let matches = active
            .get(&component)
            .is_some_and(|current| current.name() == scenario.name());
        if matches {
            active.remove(&component);
            drop(active);
            self.set_gauge(scenario, 0.0);
            info!(scenario = %scenario, "Fault scenario deactivated");
        }
        matches
    }

    pub fn deactivate_all(&self) {
        let removed: Vec<FaultScenario> = std::mem::take(&mut *self.write()).into_values().collect();
        for scenario in &removed {
            self.set_gauge(*scenario, 0.0);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "All fault scenarios deactivated");
        }
    }

    pub fn active(&self) -> Vec<FaultScenario> {
        self.read().values().copied().collect()
    }

    pub fn dispatcher_outage(&self) -> bool {
        matches!(
            self.read().get(&Stage::Dispatcher),
            Some(FaultScenario::DispatcherOutage)
        )
    }

    /// Extra latency to add to a stage's call.
    pub fn stage_delay(&self, stage: Stage) -> Option<Duration> {
        match self.read().get(&stage) {
            Some(FaultScenario::SlowStage { delay_ms, .. }) => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }

    pub fn prompt_injection(&self) -> bool {
        matches!(
            self.read().get(&Stage::Thinker),
            Some(FaultScenario::PromptInjection)
        )
    }
}
