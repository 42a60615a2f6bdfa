//! Clip Processing Pipeline
//!
//! ```text
//! Clip -> WorkerPool -> Orchestrator
//!           Observer  (StageRunner + Watchdog)
//!           triggers + policy lookup
//!           Thinker   (InputGuard, StageRunner + Watchdog)
//!           DegradationPolicy
//!           Doer      (StageRunner + Watchdog)
//!           Dispatcher (bounded retry, dedup)
//!        -> ClipOutcome
//! ```
//!
//! Every transition is appended to the audit log. A clip's stages run in
//! order on one task; different clips run concurrently.

pub mod degradation;
pub mod dispatcher;
pub mod guard;
pub mod orchestrator;
pub mod pool;
pub mod stage_runner;
pub mod triggers;
pub mod watchdog;

pub use degradation::{DegradationPolicy, Downgrade, DowngradeReason};
pub use dispatcher::{DispatchResult, Dispatcher, SkipReason};
pub use guard::{Detector, GuardHit, InputGuard};
pub use orchestrator::{ClipOutcome, ClipState, Orchestrator};
pub use pool::{worker_pool, ClipIntake, IntakeError, WorkerPool};
pub use stage_runner::{StageCall, StageFailure, StageRunner, TimeoutScope};
pub use watchdog::{DisarmOutcome, WatchScope, Watchdog, WatchdogToken};
