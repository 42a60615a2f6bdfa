//! Readiness tracking for `GET /health`.
//!
//! The service reports ready only once both the audit log and the worker
//! pool have signalled that they are initialized.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Component health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Component is operating normally
    Healthy,
    /// Component is not operational yet
    Unhealthy { reason: String },
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Unhealthy { reason } => write!(f, "UNHEALTHY: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    #[serde(flatten)]
    pub status: HealthStatus,
}

#[derive(Debug, Default)]
pub struct Readiness {
    audit: AtomicBool,
    workers: AtomicBool,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_audit_ready(&self) {
        self.audit.store(true, Ordering::SeqCst);
    }

    pub fn mark_workers_ready(&self) {
        self.workers.store(true, Ordering::SeqCst);
    }

    pub fn audit_ready(&self) -> bool {
        self.audit.load(Ordering::SeqCst)
    }

    pub fn workers_ready(&self) -> bool {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.audit_ready() && self.workers_ready()
    }

    pub fn components(&self) -> Vec<ComponentHealth> {
        let status = |ready: bool, what: &str| {
            if ready {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: format!("{what} not initialized"),
                }
            }
        };
        vec![
            ComponentHealth {
                component: "audit_log",
                status: status(self.audit_ready(), "audit log"),
            },
            ComponentHealth {
                component: "worker_pool",
                status: status(self.workers_ready(), "worker pool"),
            },
        ]
    }
}
