//! Incident / case backends: in-memory and HTTP webhook.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{BackendError, IncidentBackend};
use crate::config::defaults::WEBHOOK_TIMEOUT_SECS;
use crate::types::{CasePriority, IncidentSeverity};

// ============================================================================
// In-Memory Backend
// ============================================================================

/// Ticket as seen by the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredTicket {
    pub id: String,
    pub label: String,
    pub summary: String,
    pub linked_to: Option<String>,
}

/// Keeps tickets in memory. `set_failing(true)` makes every call fail.
#[derive(Debug, Default)]
pub struct MemoryIncidentBackend {
    next_id: AtomicU64,
    failing: AtomicBool,
    incidents: Mutex<Vec<StoredTicket>>,
    cases: Mutex<Vec<StoredTicket>>,
}

impl MemoryIncidentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn incidents(&self) -> Vec<StoredTicket> {
        self.incidents.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn cases(&self) -> Vec<StoredTicket> {
        self.cases.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BackendError::Request("backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn store(&self, list: &Mutex<Vec<StoredTicket>>, prefix: &str, ticket: StoredTicket) -> Result<String, BackendError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{prefix}-{n}");
        list.lock()
            .map_err(|_| BackendError::Request("backend lock poisoned".to_string()))?
            .push(StoredTicket { id: id.clone(), ..ticket });
        Ok(id)
    }
}

#[async_trait]
impl IncidentBackend for MemoryIncidentBackend {
    async fn create_incident(&self, severity: IncidentSeverity, summary: &str) -> Result<String, BackendError> {
        self.check()?;
        let id = self.store(
            &self.incidents,
            "INC",
            StoredTicket {
                id: String::new(),
                label: severity.to_string(),
                summary: summary.to_string(),
                linked_to: None,
            },
        )?;
        info!(incident_id = %id, severity = %severity, "Incident created");
        Ok(id)
    }

    async fn create_case(
        &self,
        priority: CasePriority,
        summary: &str,
        incident_id: &str,
    ) -> Result<String, BackendError> {
        self.check()?;
        let id = self.store(
            &self.cases,
            "CASE",
            StoredTicket {
                id: String::new(),
                label: priority.to_string(),
                summary: summary.to_string(),
                linked_to: Some(incident_id.to_string()),
            },
        )?;
        info!(case_id = %id, incident_id = %incident_id, priority = %priority, "Case created");
        Ok(id)
    }
}

// ============================================================================
// Webhook Backend
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

/// POSTs to `{base}/incidents` and `{base}/cases`; expects `{"id": "..."}` back.
#[derive(Debug, Clone)]
pub struct WebhookIncidentBackend {
    client: reqwest::Client,
    base_url: String,
}

impl WebhookIncidentBackend {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<String, BackendError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let created: CreatedResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }
}

#[async_trait]
impl IncidentBackend for WebhookIncidentBackend {
    async fn create_incident(&self, severity: IncidentSeverity, summary: &str) -> Result<String, BackendError> {
        self.post("incidents", json!({ "severity": severity, "summary": summary }))
            .await
    }

    async fn create_case(
        &self,
        priority: CasePriority,
        summary: &str,
        incident_id: &str,
    ) -> Result<String, BackendError> {
        self.post(
            "cases",
            json!({ "priority": priority, "summary": summary, "incident_id": incident_id }),
        )
        .await
    }
}
