//! Per-workflow executor: the single mutator of one workflow's state.
//!
//! Each active workflow has exactly one executor task. It advances the
//! step sequence, consults policy, pauses at approval gates, captures
//! compensations, checkpoints every boundary, and on failure walks the
//! compensation stack in reverse. The discipline at each step is side
//! effect, then compensation captured, then checkpoint, with the pending
//! compensation persisted in the same transaction as the step row.

use crate::approval::WebhookDelivery;
use crate::audit::mask_sensitive;
use crate::domain::{
    ApprovalDecision, ApprovalState, AuditLevel, CompensationEntry, CompensationIntent,
    EngineError, ExecutionState, PolicyDecision, Principal, RiskLevel, StepKind, StepSpec,
    StepStatus, TimestampUtc, UndoFn, WebhookFailMode, WorkflowId, WorkflowSpec, WorkflowStatus,
};
use crate::engine::template::resolve_inputs;
use crate::persistence::StepCheckpoint;
use crate::engine::EngineInner;
use crate::policy::PolicyContext;
use crate::registry::{HandlerOutcome, InvocationContext};
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// How one step ended, from the executor loop's point of view.
enum StepOutcome {
    Completed,
    Paused,
    Failed(EngineError),
    /// Persistence failure: the workflow is marked FAILED and rollback is
    /// not attempted, because rollback needs the same store.
    Fatal(EngineError),
}

/// Where an approval gate stands.
enum Gate {
    Approved { approver: String },
    Rejected(EngineError),
    Pause,
}

/// A successfully executed parallel branch, folded into the parent state
/// sequentially after the join.
struct BranchSuccess {
    inputs: Map<String, Value>,
    outputs: Map<String, Value>,
    intent: Option<CompensationIntent>,
    undo: Option<UndoFn>,
    started_at: TimestampUtc,
}

pub(crate) struct WorkflowExecutor {
    inner: Arc<EngineInner>,
    id: WorkflowId,
    spec: WorkflowSpec,
    state: ExecutionState,
    cancel: Arc<AtomicBool>,
}

impl WorkflowExecutor {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        id: WorkflowId,
        spec: WorkflowSpec,
        state: ExecutionState,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner,
            id,
            spec,
            state,
            cancel,
        }
    }

    /// Drives the workflow until it completes, pauses, or fails.
    pub(crate) async fn run(mut self) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.fail_and_rollback(
                    EngineError::invalid_state("canceled by operator"),
                    WorkflowStatus::Canceled,
                )
                .await;
                return;
            }

            let Some(step) = self.next_eligible().cloned() else {
                if self.remaining() > 0 {
                    // Unreachable with a validated spec, but never spin.
                    self.fail_and_rollback(
                        EngineError::StepExecution {
                            step: String::new(),
                            message: "remaining steps have unsatisfiable dependencies".to_string(),
                        },
                        WorkflowStatus::RolledBack,
                    )
                    .await;
                    return;
                }
                self.complete().await;
                return;
            };

            debug!(workflow = %self.id, step = %step.name, kind = ?step.kind, "processing step");
            let outcome = match step.kind {
                StepKind::Action => self.process_action(&step).await,
                StepKind::HumanApproval => self.process_gate(&step).await,
                StepKind::Parallel => self.process_parallel(&step).await,
            };

            match outcome {
                StepOutcome::Completed => continue,
                StepOutcome::Paused => return,
                StepOutcome::Failed(err) => {
                    self.fail_and_rollback(err, WorkflowStatus::RolledBack).await;
                    return;
                }
                StepOutcome::Fatal(err) => {
                    self.fatal(err).await;
                    return;
                }
            }
        }
    }

    /// Entry point for `resume(REJECTED)`: fail the paused gate, then roll
    /// back completed work.
    pub(crate) async fn run_rejected(mut self, step_name: &str, approver: &str) {
        let err = EngineError::ApprovalRejected {
            step: step_name.to_string(),
            approver: approver.to_string(),
        };
        let checkpoint = self.inner.store.checkpoint_step(StepCheckpoint {
            workflow_id: self.id,
            step_name,
            status: StepStatus::Failed,
            inputs: None,
            outputs: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error_message: Some(&err.to_string()),
            pending_compensation: None,
            workflow_status: None,
        });
        if let Err(e) = checkpoint {
            self.fatal(e).await;
            return;
        }
        self.fail_and_rollback(err, WorkflowStatus::RolledBack).await;
    }

    /// Entry point for `cancel()` on a workflow with no live executor.
    pub(crate) async fn run_canceled(mut self, reason: &str) {
        self.fail_and_rollback(
            EngineError::invalid_state(format!("canceled: {}", reason)),
            WorkflowStatus::Canceled,
        )
        .await;
    }

    fn next_eligible(&self) -> Option<&StepSpec> {
        self.spec.steps.iter().find(|step| {
            !self.state.is_completed(&step.name)
                && step.depends_on.iter().all(|dep| self.state.is_completed(dep))
        })
    }

    fn remaining(&self) -> usize {
        self.spec
            .steps
            .iter()
            .filter(|s| !self.state.is_completed(&s.name))
            .count()
    }

    fn principal_for(&self, step: &StepSpec) -> Principal {
        let id = step
            .agent_name
            .as_deref()
            .unwrap_or(self.spec.owner.as_str());
        Principal::agent(id)
    }

    async fn complete(&mut self) {
        self.state.status = WorkflowStatus::Completed;
        self.state.completed_at = Some(Utc::now());
        if let Err(e) = self.inner.store.update_workflow_status(
            self.id,
            WorkflowStatus::Completed,
            None,
            self.state.completed_at,
        ) {
            warn!(workflow = %self.id, error = %e, "failed to persist completion");
            return;
        }
        info!(workflow = %self.id, "workflow completed");
        self.inner.audit.record(
            Some(self.id),
            "workflow_completed",
            &self.spec.owner,
            json!({ "completed_steps": self.state.completed_steps }),
        );
    }

    async fn fatal(&mut self, err: EngineError) {
        warn!(workflow = %self.id, error = %err, "persistence failure; rollback not attempted");
        self.state.status = WorkflowStatus::Failed;
        let _ = self.inner.store.update_workflow_status(
            self.id,
            WorkflowStatus::Failed,
            Some(&err.to_string()),
            Some(Utc::now()),
        );
        self.inner.audit.record(
            Some(self.id),
            "workflow_failed",
            "engine",
            json!({ "error": err.to_string(), "rollback": "not attempted" }),
        );
    }

    // ----- ACTION steps -----------------------------------------------------

    async fn process_action(&mut self, step: &StepSpec) -> StepOutcome {
        let started = Utc::now();
        let Some(capability) = step.capability.clone() else {
            return self
                .fail_step(step, EngineError::invalid_state("ACTION step without capability"), started)
                .await;
        };

        match self.inner.registry.lifecycle(&capability) {
            Ok(lifecycle) if !lifecycle.executable() => {
                return self
                    .fail_step(
                        step,
                        EngineError::CapabilityFrozen {
                            id: capability,
                            state: lifecycle.as_str().to_string(),
                        },
                        started,
                    )
                    .await;
            }
            Ok(_) => {}
            Err(err) => return self.fail_step(step, err, started).await,
        }

        let cap_spec = self.inner.registry.get(&capability).ok();
        let risk = step
            .risk_level
            .or(cap_spec.as_ref().map(|s| s.risk.level))
            .unwrap_or(RiskLevel::High);
        let spec_requires_approval = cap_spec
            .as_ref()
            .map(|s| s.risk.requires_approval)
            .unwrap_or(false);

        let inputs = match resolve_inputs(&step.name, &step.inputs, &self.state.step_outputs) {
            Ok(inputs) => inputs,
            Err(err) => return self.fail_step(step, err, started).await,
        };

        let principal = self.principal_for(step);
        let context = PolicyContext {
            principal: principal.clone(),
            capability_id: capability.clone(),
            risk_level: risk,
            workflow_id: self.id,
            step_name: step.name.clone(),
            inputs: Value::Object(inputs.clone()),
        };
        let mut decision = self.inner.policy.evaluate(&context);
        if decision == PolicyDecision::Allow && spec_requires_approval {
            decision = PolicyDecision::RequireApproval;
        }
        self.inner.audit.record(
            Some(self.id),
            "policy_evaluated",
            &principal.qualified(),
            json!({
                "step": step.name,
                "capability": capability,
                "risk_level": risk.as_str(),
                "decision": decision.as_str(),
            }),
        );

        match decision {
            PolicyDecision::Deny => {
                return self
                    .fail_step(
                        step,
                        EngineError::PolicyDenied {
                            step: step.name.clone(),
                            capability,
                        },
                        started,
                    )
                    .await;
            }
            PolicyDecision::RequireApproval => {
                let message = format!(
                    "approval required for '{}' ({}, {} risk)",
                    step.name, capability, risk
                );
                match self.approval_gate(step, &message, &inputs).await {
                    Ok(Gate::Approved { .. }) => {}
                    Ok(Gate::Pause) => return self.pause_at(step, started).await,
                    Ok(Gate::Rejected(err)) => return self.fail_step(step, err, started).await,
                    Err(err) => return StepOutcome::Fatal(err),
                }
            }
            PolicyDecision::Allow => {}
        }

        let outcome = match self
            .execute_with_retries(step, &capability, &inputs, &principal)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return self.fail_step(step, err, started).await,
        };

        self.finish_action(step, started, inputs, outcome).await
    }

    /// Success path shared by sequential actions: merge outputs, capture the
    /// compensation, checkpoint atomically, mark complete.
    async fn finish_action(
        &mut self,
        step: &StepSpec,
        started: TimestampUtc,
        inputs: Map<String, Value>,
        outcome: HandlerOutcome,
    ) -> StepOutcome {
        self.state.merge_outputs(&step.name, &outcome.outputs);

        let intent = match self.compensation_intent(step, outcome.compensation) {
            Ok(intent) => intent,
            Err(err) => return self.fail_step(step, err, started).await,
        };

        let checkpoint = self.inner.store.checkpoint_step(StepCheckpoint {
            workflow_id: self.id,
            step_name: &step.name,
            status: StepStatus::Completed,
            inputs: Some(&inputs),
            outputs: Some(&outcome.outputs),
            started_at: started,
            completed_at: Some(Utc::now()),
            error_message: None,
            pending_compensation: intent.as_ref(),
            workflow_status: None,
        });
        if let Err(err) = checkpoint {
            return StepOutcome::Fatal(err);
        }

        if intent.is_some() || outcome.undo.is_some() {
            self.state.compensation_stack.push(CompensationEntry {
                step_name: step.name.clone(),
                intent,
                undo: outcome.undo,
            });
        }
        self.state.record_completed(&step.name);

        let mut payload = json!({
            "step": step.name,
            "outputs": mask_sensitive(Value::Object(outcome.outputs)),
        });
        if self.spec.metadata.audit_level != AuditLevel::Basic {
            payload["inputs"] = mask_sensitive(Value::Object(inputs));
        }
        self.inner.audit.record(
            Some(self.id),
            "step_completed",
            &self.principal_for(step).qualified(),
            payload,
        );
        StepOutcome::Completed
    }

    /// An explicit compensation on the step spec wins over whatever the
    /// handler emitted; its inputs may reference the step's own outputs.
    fn compensation_intent(
        &self,
        step: &StepSpec,
        from_handler: Option<CompensationIntent>,
    ) -> Result<Option<CompensationIntent>, EngineError> {
        if let Some(explicit) = &step.compensation {
            let inputs = resolve_inputs(&step.name, &explicit.inputs, &self.state.step_outputs)?;
            return Ok(Some(CompensationIntent {
                capability: explicit.capability.clone(),
                inputs,
            }));
        }
        Ok(from_handler)
    }

    async fn execute_with_retries(
        &self,
        step: &StepSpec,
        capability: &str,
        inputs: &Map<String, Value>,
        principal: &Principal,
    ) -> Result<HandlerOutcome, EngineError> {
        let handler = self.inner.registry.resolve_handler(capability)?;
        let ctx = InvocationContext {
            workflow_id: self.id,
            step_name: step.name.clone(),
            principal: principal.clone(),
        };

        let attempts = step.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let call = handler.execute(inputs, &ctx);
            let result = match step.timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                    Ok(inner) => inner,
                    Err(_) => Err(anyhow::anyhow!("attempt timed out after {}ms", ms)),
                },
                None => call.await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        workflow = %self.id,
                        step = %step.name,
                        attempt,
                        attempts,
                        error = %last_error,
                        "step attempt failed"
                    );
                    self.inner.audit.record(
                        Some(self.id),
                        "step_attempt_failed",
                        &ctx.principal.qualified(),
                        json!({ "step": step.name, "attempt": attempt, "error": last_error }),
                    );
                    if attempt < attempts {
                        tokio::time::sleep(retry_backoff(attempt)).await;
                    }
                }
            }
        }

        Err(EngineError::StepExecution {
            step: step.name.clone(),
            message: format!("{} attempts exhausted: {}", attempts, last_error),
        })
    }

    // ----- Approval gates ---------------------------------------------------

    async fn process_gate(&mut self, step: &StepSpec) -> StepOutcome {
        let started = Utc::now();
        let message = step
            .inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("approval required")
            .to_string();

        match self.approval_gate(step, &message, &step.inputs).await {
            Ok(Gate::Approved { approver }) => {
                let mut outputs = Map::new();
                outputs.insert("approved".to_string(), json!(true));
                outputs.insert("approver".to_string(), json!(approver));

                let checkpoint =
                    self.inner.store.checkpoint_step(StepCheckpoint {
                        workflow_id: self.id,
                        step_name: &step.name,
                        status: StepStatus::Completed,
                        inputs: Some(&step.inputs),
                        outputs: Some(&outputs),
                        started_at: started,
                        completed_at: Some(Utc::now()),
                        error_message: None,
                        pending_compensation: None,
                        workflow_status: None,
                    });
                if let Err(err) = checkpoint {
                    return StepOutcome::Fatal(err);
                }
                self.state.merge_outputs(&step.name, &outputs);
                self.state.record_completed(&step.name);
                StepOutcome::Completed
            }
            Ok(Gate::Pause) => self.pause_at(step, started).await,
            Ok(Gate::Rejected(err)) => self.fail_step(step, err, started).await,
            Err(err) => StepOutcome::Fatal(err),
        }
    }

    /// Decides where a gate stands: already approved, already rejected or
    /// timed out, or pending (request the approval and pause).
    async fn approval_gate(
        &self,
        step: &StepSpec,
        message: &str,
        payload: &Map<String, Value>,
    ) -> Result<Gate, EngineError> {
        if let Some(record) = self.inner.approvals.get(self.id, &step.name)? {
            match record.state {
                ApprovalState::Approved => {
                    return Ok(Gate::Approved {
                        approver: record.approver.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                ApprovalState::Rejected => {
                    return Ok(Gate::Rejected(EngineError::ApprovalRejected {
                        step: step.name.clone(),
                        approver: record.approver.unwrap_or_else(|| "unknown".to_string()),
                    }));
                }
                ApprovalState::Timeout => {
                    return Ok(Gate::Rejected(EngineError::ApprovalTimeout {
                        step: step.name.clone(),
                    }));
                }
                ApprovalState::Pending => {
                    if let Some(timeout_ms) = step.timeout_ms {
                        if approval_expired(&record.requested_at, timeout_ms) {
                            self.inner.approvals.record_timeout(self.id, &step.name)?;
                            return Ok(Gate::Rejected(EngineError::ApprovalTimeout {
                                step: step.name.clone(),
                            }));
                        }
                    }
                    return Ok(Gate::Pause);
                }
            }
        }

        let context = mask_sensitive(Value::Object(payload.clone()));
        let delivery = self
            .inner
            .approvals
            .request_approval(self.id, &self.spec.name, &step.name, message, context)
            .await?;
        self.inner.audit.record(
            Some(self.id),
            "approval_requested",
            &self.principal_for(step).qualified(),
            json!({ "step": step.name, "message": message, "delivery": format!("{:?}", delivery) }),
        );

        match delivery {
            WebhookDelivery::Delivered | WebhookDelivery::Skipped => Ok(Gate::Pause),
            WebhookDelivery::Failed(reason) => match self.inner.config.webhook_fail_mode {
                WebhookFailMode::Pause => Ok(Gate::Pause),
                WebhookFailMode::Allow => {
                    warn!(workflow = %self.id, step = %step.name, "webhook failed; fail mode ALLOW approves the gate");
                    self.inner.approvals.record_decision(
                        self.id,
                        &step.name,
                        ApprovalDecision::Approved,
                        "webhook-fail-mode",
                        Some(&reason),
                    )?;
                    Ok(Gate::Approved {
                        approver: "webhook-fail-mode".to_string(),
                    })
                }
                WebhookFailMode::Deny => {
                    self.inner.approvals.record_decision(
                        self.id,
                        &step.name,
                        ApprovalDecision::Rejected,
                        "webhook-fail-mode",
                        Some(&reason),
                    )?;
                    Ok(Gate::Rejected(EngineError::ApprovalRejected {
                        step: step.name.clone(),
                        approver: "webhook-fail-mode".to_string(),
                    }))
                }
            },
        }
    }

    /// Checkpoints the step as PAUSED and the workflow as PAUSED in one
    /// transaction, then suspends the executor.
    async fn pause_at(&mut self, step: &StepSpec, started: TimestampUtc) -> StepOutcome {
        let checkpoint = self.inner.store.checkpoint_step(StepCheckpoint {
            workflow_id: self.id,
            step_name: &step.name,
            status: StepStatus::Paused,
            inputs: Some(&step.inputs),
            outputs: None,
            started_at: started,
            completed_at: None,
            error_message: None,
            pending_compensation: None,
            workflow_status: Some(WorkflowStatus::Paused),
        });
        match checkpoint {
            Ok(()) => {
                self.state.status = WorkflowStatus::Paused;
                info!(workflow = %self.id, step = %step.name, "workflow paused awaiting approval");
                self.inner.audit.record(
                    Some(self.id),
                    "workflow_paused",
                    "engine",
                    json!({ "step": step.name }),
                );
                StepOutcome::Paused
            }
            Err(err) => StepOutcome::Fatal(err),
        }
    }

    // ----- PARALLEL groups --------------------------------------------------

    /// Runs a group's branches concurrently, then folds their results into
    /// the parent state sequentially. The group shares the parent's
    /// compensation stack and is one unit: any branch failure fails the
    /// group, after every branch has settled and successful branches have
    /// checkpointed their compensations.
    async fn process_parallel(&mut self, group: &StepSpec) -> StepOutcome {
        let started = Utc::now();
        let snapshot = self.state.step_outputs.clone();

        let branches = group
            .steps
            .iter()
            .map(|sub| self.run_branch(sub, &snapshot));
        let results = futures::future::join_all(branches).await;

        let mut first_failure: Option<EngineError> = None;
        for (sub, result) in group.steps.iter().zip(results) {
            match result {
                Ok(branch) => {
                    self.state.merge_outputs(&sub.name, &branch.outputs);
                    let checkpoint =
                        self.inner.store.checkpoint_step(StepCheckpoint {
                            workflow_id: self.id,
                            step_name: &sub.name,
                            status: StepStatus::Completed,
                            inputs: Some(&branch.inputs),
                            outputs: Some(&branch.outputs),
                            started_at: branch.started_at,
                            completed_at: Some(Utc::now()),
                            error_message: None,
                            pending_compensation: branch.intent.as_ref(),
                            workflow_status: None,
                        });
                    if let Err(err) = checkpoint {
                        return StepOutcome::Fatal(err);
                    }
                    if branch.intent.is_some() || branch.undo.is_some() {
                        self.state.compensation_stack.push(CompensationEntry {
                            step_name: sub.name.clone(),
                            intent: branch.intent,
                            undo: branch.undo,
                        });
                    }
                    self.state.record_completed(&sub.name);
                }
                Err(err) => {
                    let checkpoint =
                        self.inner.store.checkpoint_step(StepCheckpoint {
                            workflow_id: self.id,
                            step_name: &sub.name,
                            status: StepStatus::Failed,
                            inputs: None,
                            outputs: None,
                            started_at: started,
                            completed_at: Some(Utc::now()),
                            error_message: Some(&err.to_string()),
                            pending_compensation: None,
                            workflow_status: None,
                        });
                    if let Err(persist_err) = checkpoint {
                        return StepOutcome::Fatal(persist_err);
                    }
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_failure {
            return self.fail_step(group, err, started).await;
        }

        let checkpoint = self.inner.store.checkpoint_step(StepCheckpoint {
            workflow_id: self.id,
            step_name: &group.name,
            status: StepStatus::Completed,
            inputs: None,
            outputs: None,
            started_at: started,
            completed_at: Some(Utc::now()),
            error_message: None,
            pending_compensation: None,
            workflow_status: None,
        });
        if let Err(err) = checkpoint {
            return StepOutcome::Fatal(err);
        }
        self.state.record_completed(&group.name);
        StepOutcome::Completed
    }

    /// One parallel branch: policy-checked and executed like an action, but
    /// against a read-only snapshot of the outputs. Approval gates cannot
    /// suspend a half-completed group, so a REQUIRE_APPROVAL decision is a
    /// branch failure.
    async fn run_branch(
        &self,
        sub: &StepSpec,
        snapshot: &std::collections::HashMap<String, Value>,
    ) -> Result<BranchSuccess, EngineError> {
        let started = Utc::now();
        let capability = sub
            .capability
            .clone()
            .ok_or_else(|| EngineError::invalid_state("ACTION step without capability"))?;

        let lifecycle = self.inner.registry.lifecycle(&capability)?;
        if !lifecycle.executable() {
            return Err(EngineError::CapabilityFrozen {
                id: capability,
                state: lifecycle.as_str().to_string(),
            });
        }

        let cap_spec = self.inner.registry.get(&capability).ok();
        let risk = sub
            .risk_level
            .or(cap_spec.as_ref().map(|s| s.risk.level))
            .unwrap_or(RiskLevel::High);

        let inputs = resolve_inputs(&sub.name, &sub.inputs, snapshot)?;
        let principal = self.principal_for(sub);
        let decision = self.inner.policy.evaluate(&PolicyContext {
            principal: principal.clone(),
            capability_id: capability.clone(),
            risk_level: risk,
            workflow_id: self.id,
            step_name: sub.name.clone(),
            inputs: Value::Object(inputs.clone()),
        });
        match decision {
            PolicyDecision::Allow => {}
            PolicyDecision::Deny => {
                return Err(EngineError::PolicyDenied {
                    step: sub.name.clone(),
                    capability,
                });
            }
            PolicyDecision::RequireApproval => {
                return Err(EngineError::StepExecution {
                    step: sub.name.clone(),
                    message: format!(
                        "'{}' requires approval, which a parallel branch cannot wait for",
                        capability
                    ),
                });
            }
        }

        let outcome = self
            .execute_with_retries(sub, &capability, &inputs, &principal)
            .await?;

        let intent = if let Some(explicit) = &sub.compensation {
            // Branch compensations may reference the branch's own outputs.
            let mut scope = snapshot.clone();
            for (key, value) in &outcome.outputs {
                scope.insert(format!("{}.{}", sub.name, key), value.clone());
            }
            Some(CompensationIntent {
                capability: explicit.capability.clone(),
                inputs: resolve_inputs(&sub.name, &explicit.inputs, &scope)?,
            })
        } else {
            outcome.compensation
        };

        Ok(BranchSuccess {
            inputs,
            outputs: outcome.outputs,
            intent,
            undo: outcome.undo,
            started_at: started,
        })
    }

    // ----- Failure and rollback ---------------------------------------------

    /// Checkpoints the failing step, then hands the error to the caller so
    /// the loop enters rollback.
    async fn fail_step(
        &mut self,
        step: &StepSpec,
        err: EngineError,
        started: TimestampUtc,
    ) -> StepOutcome {
        warn!(workflow = %self.id, step = %step.name, error = %err, "step failed");
        let checkpoint = self.inner.store.checkpoint_step(StepCheckpoint {
            workflow_id: self.id,
            step_name: &step.name,
            status: StepStatus::Failed,
            inputs: None,
            outputs: None,
            started_at: started,
            completed_at: Some(Utc::now()),
            error_message: Some(&err.to_string()),
            pending_compensation: None,
            workflow_status: None,
        });
        if let Err(persist_err) = checkpoint {
            return StepOutcome::Fatal(persist_err);
        }
        self.inner.audit.record(
            Some(self.id),
            "step_failed",
            &self.principal_for(step).qualified(),
            json!({ "step": step.name, "error": err.to_string() }),
        );
        StepOutcome::Failed(err)
    }

    /// Marks the workflow FAILED, walks the compensation stack LIFO, and
    /// settles on the terminal status. A failed compensation is recorded
    /// and rollback continues; a persistence failure aborts rollback.
    async fn fail_and_rollback(&mut self, err: EngineError, terminal: WorkflowStatus) {
        self.state.status = WorkflowStatus::Failed;
        self.state.error_message = Some(err.to_string());
        if let Err(persist_err) = self.inner.store.update_workflow_status(
            self.id,
            WorkflowStatus::Failed,
            Some(&err.to_string()),
            None,
        ) {
            self.fatal(persist_err).await;
            return;
        }
        self.inner.audit.record(
            Some(self.id),
            "workflow_failed",
            "engine",
            json!({ "error": err.to_string(), "auto_rollback": self.spec.auto_rollback }),
        );

        if !self.spec.auto_rollback {
            let _ = self.inner.store.update_workflow_status(
                self.id,
                WorkflowStatus::Failed,
                None,
                Some(Utc::now()),
            );
            return;
        }

        match self.rollback().await {
            Ok(partial) => {
                let message = if partial {
                    format!("{} (partial_rollback=true)", err)
                } else {
                    err.to_string()
                };
                self.state.status = terminal;
                self.state.completed_at = Some(Utc::now());
                let _ = self.inner.store.update_workflow_status(
                    self.id,
                    terminal,
                    Some(&message),
                    self.state.completed_at,
                );
                info!(workflow = %self.id, status = %terminal, partial, "rollback finished");
                self.inner.audit.record(
                    Some(self.id),
                    "workflow_rolled_back",
                    "engine",
                    json!({ "terminal": terminal.as_str(), "partial_rollback": partial }),
                );
            }
            Err(persist_err) => self.fatal(persist_err).await,
        }
    }

    /// Pops the stack LIFO. Intent form is authoritative; a closure is used
    /// only when no intent was captured and the process has not restarted.
    /// Returns whether any compensation failed.
    async fn rollback(&mut self) -> Result<bool, EngineError> {
        let mut partial = false;
        while let Some(entry) = self.state.compensation_stack.pop() {
            let result: anyhow::Result<()> = if let Some(intent) = &entry.intent {
                self.execute_intent(intent, &entry.step_name).await
            } else if let Some(undo) = entry.undo {
                undo().await
            } else {
                Ok(())
            };

            let (success, error) = match &result {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            if !success {
                partial = true;
                warn!(
                    workflow = %self.id,
                    step = %entry.step_name,
                    error = error.as_deref().unwrap_or(""),
                    "compensation failed; rollback continues"
                );
            }
            self.inner.audit.record(
                Some(self.id),
                "compensation_executed",
                "engine",
                json!({ "step": entry.step_name, "success": success, "error": error }),
            );
            self.inner.store.record_compensation_result(
                self.id,
                &entry.step_name,
                Utc::now(),
                success,
                error.as_deref(),
            )?;
        }
        Ok(partial)
    }

    /// Re-enacts an intent by invoking its compensating capability.
    /// Compensations run under the engine's own principal and bypass
    /// policy: rollback must not be blockable by the rules that caused it.
    async fn execute_intent(
        &self,
        intent: &CompensationIntent,
        step_name: &str,
    ) -> anyhow::Result<()> {
        let handler = self.inner.registry.resolve_handler(&intent.capability)?;
        let ctx = InvocationContext {
            workflow_id: self.id,
            step_name: step_name.to_string(),
            principal: Principal {
                kind: "system".to_string(),
                id: "rollback".to_string(),
                roles: Vec::new(),
            },
        };
        handler.execute(&intent.inputs, &ctx).await.map(|_| ())
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(4));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
    exp.min(BACKOFF_CAP) + jitter
}

fn approval_expired(requested_at: &str, timeout_ms: u64) -> bool {
    match chrono::DateTime::parse_from_rfc3339(requested_at) {
        Ok(requested) => {
            let elapsed = Utc::now().signed_duration_since(requested.with_timezone(&Utc));
            elapsed.num_milliseconds() >= timeout_ms as i64
        }
        Err(_) => false,
    }
}
