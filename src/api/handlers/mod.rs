//! API route handlers
//!
//! Request handling logic for all API endpoints including:
//! - Health / readiness and the running configuration
//! - Audit queries, KPI roll-ups and incidents
//! - Fault scenario control and clip submission
//! - Prometheus metrics

mod audit;
mod clips;
mod faults;
mod metrics;
mod status;

pub use audit::*;
pub use clips::*;
pub use faults::*;
pub use metrics::*;
pub use status::*;

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::escalation::IncidentEscalator;
use crate::faults::FaultInjector;
use crate::health::Readiness;
use crate::metrics::Metrics;
use crate::pipeline::ClipIntake;

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub faults: Arc<FaultInjector>,
    pub escalator: Arc<IncidentEscalator>,
    /// Producer half of the worker pool's queue
    pub intake: ClipIntake,
    pub readiness: Arc<Readiness>,
    pub config: Arc<PipelineConfig>,
}

impl ApiState {
    pub fn from_engine(engine: &Engine, intake: ClipIntake) -> Self {
        Self {
            audit: Arc::clone(&engine.audit),
            metrics: Arc::clone(&engine.metrics),
            faults: Arc::clone(&engine.faults),
            escalator: Arc::clone(&engine.escalator),
            intake,
            readiness: Arc::clone(&engine.readiness),
            config: Arc::new(engine.config.clone()),
        }
    }
}
