//! Best-effort webhook notification for approval gates.
//!
//! Delivery is notification only: the approval decision always comes back
//! out of band through `resume`. Transport errors are retried a bounded
//! number of times; a delivery failure never aborts the pause itself.

use crate::domain::WorkflowId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// The JSON body posted to the approval webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub workflow_id: String,
    pub workflow_name: String,
    pub step_name: String,
    pub message: String,
    pub requested_at: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl WebhookEnvelope {
    pub fn new(
        workflow_id: WorkflowId,
        workflow_name: &str,
        step_name: &str,
        message: &str,
        context: Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            step_name: step_name.to_string(),
            message: message.to_string(),
            requested_at: crate::domain::format_timestamp(chrono::Utc::now()),
            context,
        }
    }
}

/// Blocking HTTP client for webhook delivery. Run it on a blocking worker;
/// it never executes on the async runtime directly.
#[derive(Clone)]
pub struct WebhookClient {
    url: String,
    agent: ureq::Agent,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_millis(timeout_ms)))
            // Statuses are inspected explicitly below; a 4xx/5xx answer is
            // a definitive refusal, not a transport error to retry.
            .http_status_as_error(false)
            .build();
        Self {
            url: url.into(),
            agent: config.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts the envelope, retrying transient transport errors.
    /// A 2xx response means the notification was received.
    pub fn notify(&self, envelope: &WebhookEnvelope) -> Result<()> {
        let body = serde_json::to_string(envelope).context("Failed to serialize webhook body")?;

        let mut last_error = None;
        for attempt in 1..=DELIVERY_ATTEMPTS {
            let result = self
                .agent
                .post(&self.url)
                .header("Content-Type", "application/json")
                .send(body.as_str());

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    // A non-2xx answer is a definitive refusal; do not retry.
                    anyhow::bail!(
                        "webhook at {} answered {}",
                        self.url,
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        url = %self.url,
                        error = %e,
                        "webhook delivery attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < DELIVERY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery to {} failed after {} attempts: {}",
            self.url,
            DELIVERY_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}
