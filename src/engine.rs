//! Engine assembly
//!
//! Wires one audit log and one metrics registry into every component. The
//! binary and the integration tests both build the pipeline through here.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::audit::{AuditLog, AuditStore, MemoryAuditStore, SledAuditStore};
use crate::capabilities::{Capabilities, IncidentBackend, MemoryIncidentBackend};
use crate::config::PipelineConfig;
use crate::escalation::IncidentEscalator;
use crate::faults::FaultInjector;
use crate::health::Readiness;
use crate::metrics::Metrics;
use crate::pipeline::{worker_pool, ClipIntake, Orchestrator, WorkerPool};

pub struct Engine {
    pub config: PipelineConfig,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub faults: Arc<FaultInjector>,
    pub orchestrator: Arc<Orchestrator>,
    pub escalator: Arc<IncidentEscalator>,
    pub readiness: Arc<Readiness>,
}

impl Engine {
    pub fn build(
        config: PipelineConfig,
        capabilities: Capabilities,
        backend: Arc<dyn IncidentBackend>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new());

        let store: Box<dyn AuditStore> = match &config.audit.path {
            Some(path) => Box::new(
                SledAuditStore::open(path)
                    .with_context(|| format!("opening audit store at {}", path.display()))?,
            ),
            None => Box::new(MemoryAuditStore::new()),
        };
        let audit = Arc::new(AuditLog::new(
            store,
            config.audit.capacity,
            config.escalation.channel_capacity,
            Arc::clone(&metrics),
        )?);
        let readiness = Arc::new(Readiness::new());
        readiness.mark_audit_ready();
        info!(
            durable = config.audit.path.is_some(),
            capacity = config.audit.capacity,
            last_seq = audit.last_seq()?,
            "Audit log ready"
        );

        let faults = Arc::new(FaultInjector::new(Arc::clone(&metrics)));
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            capabilities,
            Arc::clone(&audit),
            Arc::clone(&metrics),
            Arc::clone(&faults),
        )?);
        let escalator = Arc::new(IncidentEscalator::new(
            &config.escalation,
            backend,
            Arc::clone(&audit),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            audit,
            metrics,
            faults,
            orchestrator,
            escalator,
            readiness,
        })
    }

    /// Stub capabilities and an in-memory incident backend.
    pub fn in_memory(config: PipelineConfig) -> anyhow::Result<(Self, Arc<MemoryIncidentBackend>)> {
        Self::with_capabilities(config, Capabilities::stub())
    }

    pub fn with_capabilities(
        config: PipelineConfig,
        capabilities: Capabilities,
    ) -> anyhow::Result<(Self, Arc<MemoryIncidentBackend>)> {
        let backend = Arc::new(MemoryIncidentBackend::new());
        let engine = Self::build(
            config,
            capabilities,
            Arc::clone(&backend) as Arc<dyn IncidentBackend>,
        )?;
        Ok((engine, backend))
    }

    pub fn worker_pool(&self) -> (ClipIntake, WorkerPool) {
        worker_pool(
            &self.config.workers,
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.metrics),
        )
    }
}
