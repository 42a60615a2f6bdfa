//! External capabilities consumed by the pipeline
//!
//! The language models, the policy lookup, the action executor and the
//! incident backend all sit behind async traits so the engine can run
//! against deterministic stubs or real services.

mod executor;
mod incident;
mod policy;
mod stub;

pub use executor::{ConsoleExecutor, WebhookExecutor};
pub use incident::{MemoryIncidentBackend, WebhookIncidentBackend};
pub use policy::StaticPolicyLookup;
pub use stub::StubModel;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Action, CasePriority, IncidentSeverity, Stage};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("capability call failed: {0}")]
    Failed(String),
    #[error("capability timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("incident backend request failed: {0}")]
    Request(String),
    #[error("incident backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("incident backend returned an unexpected response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// Traits
// ============================================================================

/// One model-backed stage (observe / think / do).
#[async_trait]
pub trait ModelCapability: Send + Sync {
    /// Produce raw JSON output for `input`.
    ///
    /// `timeout` is the stage deadline, passed as a hint. The pipeline
    /// enforces it regardless.
    async fn complete(&self, stage: Stage, input: Value, timeout: Duration) -> Result<Value, CapabilityError>;
}

/// Policy / SOP citation lookup.
#[async_trait]
pub trait PolicyLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Vec<String>, CapabilityError>;
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Delivered; optional reference from the receiving system
    Ok(Option<String>),
    /// Worth retrying
    Transient(String),
    /// Retrying will not help
    Permanent(String),
}

/// Delivers actions to operators.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> ExecOutcome;
}

/// Incident and case ticketing. Calls may be repeated and must be safe to
/// receive more than once.
#[async_trait]
pub trait IncidentBackend: Send + Sync {
    async fn create_incident(&self, severity: IncidentSeverity, summary: &str) -> Result<String, BackendError>;

    async fn create_case(
        &self,
        priority: CasePriority,
        summary: &str,
        incident_id: &str,
    ) -> Result<String, BackendError>;
}

/// The capability set one orchestrator runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub observer: Arc<dyn ModelCapability>,
    pub thinker: Arc<dyn ModelCapability>,
    pub doer: Arc<dyn ModelCapability>,
    pub policy: Arc<dyn PolicyLookup>,
    pub executor: Arc<dyn ActionExecutor>,
}

impl Capabilities {
    /// Deterministic stubs for every capability.
    pub fn stub() -> Self {
        let model: Arc<dyn ModelCapability> = Arc::new(StubModel::new());
        Self {
            observer: Arc::clone(&model),
            thinker: Arc::clone(&model),
            doer: model,
            policy: Arc::new(StaticPolicyLookup::default()),
            executor: Arc::new(ConsoleExecutor),
        }
    }

    pub fn model(&self, stage: Stage) -> Option<&Arc<dyn ModelCapability>> {
        match stage {
            Stage::Observer => Some(&self.observer),
            Stage::Thinker => Some(&self.thinker),
            Stage::Doer => Some(&self.doer),
            Stage::Dispatcher => None,
        }
    }
}
