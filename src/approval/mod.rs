//! Human approval manager: pause bookkeeping and approver notification.
//!
//! A paused workflow is represented by a PENDING approval record in the
//! store plus a PAUSED step checkpoint written by the engine. This module
//! owns the records and the webhook notification; the engine owns the
//! pause/resume control flow.

pub mod webhook;

pub use webhook::{WebhookClient, WebhookEnvelope};

use crate::domain::{ApprovalDecision, ApprovalState, EngineError, WorkflowId};
use crate::persistence::{ApprovalRow, Store};
use serde_json::Value;
use std::sync::Arc;

/// Outcome of the best-effort webhook notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDelivery {
    /// The webhook acknowledged the notification.
    Delivered,
    /// No webhook is configured; the pause must be resumed out-of-band.
    Skipped,
    /// Delivery failed after retries. The pause stands; the engine decides
    /// what to do with the gate via its configured fail mode.
    Failed(String),
}

/// Pause/resume record keeper with external notification.
pub struct ApprovalManager {
    store: Arc<Store>,
    webhook: Option<Arc<WebhookClient>>,
}

impl ApprovalManager {
    pub fn new(store: Arc<Store>, webhook: Option<Arc<WebhookClient>>) -> Self {
        Self { store, webhook }
    }

    /// Persists a PENDING approval record and notifies the approver.
    /// Returns immediately after the (bounded) delivery attempt; failure to
    /// deliver does not abort the pause.
    pub async fn request_approval(
        &self,
        workflow_id: WorkflowId,
        workflow_name: &str,
        step_name: &str,
        message: &str,
        context_payload: Value,
    ) -> Result<WebhookDelivery, EngineError> {
        self.store.insert_approval(workflow_id, step_name, message)?;

        let Some(client) = self.webhook.clone() else {
            return Ok(WebhookDelivery::Skipped);
        };

        let envelope =
            WebhookEnvelope::new(workflow_id, workflow_name, step_name, message, context_payload);
        let delivery = tokio::task::spawn_blocking(move || client.notify(&envelope))
            .await
            .map_err(|e| EngineError::persistence(format!("webhook task: {}", e)))?;

        match delivery {
            Ok(()) => Ok(WebhookDelivery::Delivered),
            Err(e) => {
                tracing::warn!(
                    workflow = %workflow_id,
                    step = step_name,
                    error = %e,
                    "approval webhook not delivered; workflow stays paused"
                );
                Ok(WebhookDelivery::Failed(e.to_string()))
            }
        }
    }

    /// Records an approver's decision. Repeated identical decisions are
    /// accepted; conflicting decisions fail with `ApprovalConflict`.
    pub fn record_decision(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        decision: ApprovalDecision,
        approver: &str,
        rationale: Option<&str>,
    ) -> Result<(), EngineError> {
        let state = match decision {
            ApprovalDecision::Approved => ApprovalState::Approved,
            ApprovalDecision::Rejected => ApprovalState::Rejected,
        };
        self.store
            .decide_approval(workflow_id, step_name, state, approver, rationale)
    }

    /// Marks a pending gate as timed out; the engine treats this as a
    /// rejection.
    pub fn record_timeout(&self, workflow_id: WorkflowId, step_name: &str) -> Result<(), EngineError> {
        self.store.decide_approval(
            workflow_id,
            step_name,
            ApprovalState::Timeout,
            "system",
            Some("approval window elapsed"),
        )
    }

    /// Reads PENDING records, optionally narrowed to one step.
    pub fn get_pending(
        &self,
        workflow_id: WorkflowId,
        step_name: Option<&str>,
    ) -> Result<Vec<ApprovalRow>, EngineError> {
        self.store.pending_approvals(workflow_id, step_name)
    }

    /// The current record for one gate, whatever its state.
    pub fn get(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
    ) -> Result<Option<ApprovalRow>, EngineError> {
        self.store.latest_approval(workflow_id, step_name)
    }
}

#[cfg(test)]
#[path = "tests/approval_tests.rs"]
mod tests;
