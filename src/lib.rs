//! stagewarden: Stage Orchestration and SLO Enforcement
//!
//! Drives each video clip through a fixed chain of model-backed stages and
//! keeps every step inside its latency budget.
//!
//! ## Architecture
//!
//! - **Orchestrator**: Observer -> Thinker -> Doer -> Dispatcher per clip
//! - **Watchdog**: Per-stage and end-to-end deadlines as RAII timers
//! - **DegradationPolicy**: Caps action severity on weak evidence
//! - **Dispatcher**: Bounded retry with backoff and duplicate suppression
//! - **AuditLog**: Append-only record of every transition
//! - **IncidentEscalator**: Opens deduplicated incidents and cases from audit patterns
//! - **FaultInjector**: Named failure scenarios for drills and tests

pub mod api;
pub mod audit;
pub mod capabilities;
pub mod config;
pub mod engine;
pub mod escalation;
pub mod faults;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod types;

// Re-export configuration
pub use config::PipelineConfig;

// Re-export commonly used types
pub use types::{
    Action, ActionType, AuditEvent, AuditKind, CaseRecord, Clip, Decision, IncidentRecord,
    Stage,
};

// Re-export the assembled engine and its parts
pub use audit::{AuditError, AuditFilter, AuditLog};
pub use engine::Engine;
pub use escalation::IncidentEscalator;
pub use faults::{FaultInjector, FaultScenario};
pub use metrics::Metrics;
pub use pipeline::{ClipOutcome, ClipState, Orchestrator};
