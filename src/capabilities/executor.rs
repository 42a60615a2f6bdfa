//! Action executors: console log and HTTP webhook.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ActionExecutor, ExecOutcome};
use crate::config::defaults::WEBHOOK_TIMEOUT_SECS;
use crate::types::Action;

/// Logs every action and always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleExecutor;

#[async_trait]
impl ActionExecutor for ConsoleExecutor {
    async fn execute(&self, action: &Action) -> ExecOutcome {
        info!(
            action = %action.action_type,
            target = %action.target,
            priority = ?action.priority,
            steps = action.steps.len(),
            "ACTION: {}",
            action.operator_message
        );
        ExecOutcome::Ok(None)
    }
}

/// POSTs the action as JSON.
///
/// 2xx is delivered; 408, 429, 5xx, timeouts and connection errors are
/// transient; any other status is permanent.
#[derive(Debug, Clone)]
pub struct WebhookExecutor {
    client: reqwest::Client,
    url: String,
}

impl WebhookExecutor {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn classify(status: reqwest::StatusCode) -> Option<bool> {
        if status.is_success() {
            None
        } else {
            Some(
                status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT,
            )
        }
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    async fn execute(&self, action: &Action) -> ExecOutcome {
        let response = match self.client.post(&self.url).json(action).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return ExecOutcome::Transient(e.to_string());
            }
            Err(e) => return ExecOutcome::Permanent(e.to_string()),
        };

        let status = response.status();
        match Self::classify(status) {
            None => {
                let reference = response
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                debug!(url = %self.url, status = %status, "Webhook delivered action");
                ExecOutcome::Ok(reference)
            }
            Some(true) => ExecOutcome::Transient(format!("webhook returned {status}")),
            Some(false) => ExecOutcome::Permanent(format!("webhook returned {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert_eq!(WebhookExecutor::classify(StatusCode::OK), None);
        assert_eq!(WebhookExecutor::classify(StatusCode::BAD_GATEWAY), Some(true));
        assert_eq!(WebhookExecutor::classify(StatusCode::TOO_MANY_REQUESTS), Some(true));
        assert_eq!(WebhookExecutor::classify(StatusCode::BAD_REQUEST), Some(false));
        assert_eq!(WebhookExecutor::classify(StatusCode::UNAUTHORIZED), Some(false));
    }
}
