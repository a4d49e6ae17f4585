//! The workflow engine: the only component that mutates workflow state.
//!
//! Composes the registry, policy engine, persistence layer, approval
//! manager, and audit log, all injected at construction with no singletons.
//! Each started workflow gets exactly one executor task; the engine's
//! public surface is `submit` / `start` / `resume` / `cancel` / `status`
//! plus explicit crash recovery.

mod executor;
pub mod recovery;
pub mod template;

use crate::approval::ApprovalManager;
use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::domain::{
    ApprovalDecision, EngineError, ExecutionState, WorkflowId, WorkflowSpec, WorkflowStatus,
};
use crate::persistence::Store;
use crate::policy::PolicyEngine;
use crate::registry::CapabilityRegistry;
use executor::WorkflowExecutor;
use recovery::rebuild_state;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Immutable view of one workflow's progress.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub status: WorkflowStatus,
    pub completed_steps: Vec<String>,
    pub error_message: Option<String>,
}

struct WorkflowHandle {
    cancel: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<Store>,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) policy: Arc<PolicyEngine>,
    pub(crate) approvals: Arc<ApprovalManager>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) config: EngineConfig,
    active: Mutex<HashMap<WorkflowId, WorkflowHandle>>,
    /// Serializes start/resume/cancel/recovery dispatch per workflow, held
    /// from the status read through executor spawn so two concurrent calls
    /// can never both observe the same pre-transition status and each
    /// spawn an executor.
    dispatch: Mutex<HashMap<WorkflowId, Arc<AsyncMutex<()>>>>,
}

/// The transactional workflow control plane.
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Wires the engine together. Construction never recovers workflows;
    /// call [`recover_on_startup`](Self::recover_on_startup) explicitly, or
    /// use [`with_recovery`](Self::with_recovery) to honor
    /// `auto_resume_on_startup`.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<CapabilityRegistry>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalManager>,
        audit: Arc<AuditLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                policy,
                approvals,
                audit,
                config,
                active: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Construction plus recovery when `auto_resume_on_startup` is set.
    /// Returns the engine and the workflows that were reattached.
    pub async fn with_recovery(
        store: Arc<Store>,
        registry: Arc<CapabilityRegistry>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalManager>,
        audit: Arc<AuditLog>,
        config: EngineConfig,
    ) -> Result<(Self, Vec<WorkflowId>), EngineError> {
        let engine = Self::new(store, registry, policy, approvals, audit, config);
        let recovered = if engine.inner.config.auto_resume_on_startup {
            engine.recover_on_startup().await?
        } else {
            Vec::new()
        };
        Ok((engine, recovered))
    }

    /// Validates a spec, assigns an id, and persists the workflow in
    /// PENDING status with the spec serialized verbatim. Does not execute.
    pub fn submit(&self, spec: &WorkflowSpec) -> Result<WorkflowId, EngineError> {
        spec.validate()?;
        let id = WorkflowId::new();
        let yaml = spec.to_yaml()?;
        self.inner.store.create_workflow(id, spec, &yaml)?;
        info!(workflow = %id, name = %spec.name, "workflow submitted");
        self.inner.audit.record(
            Some(id),
            "workflow_submitted",
            &spec.owner,
            json!({ "name": spec.name, "version": spec.version, "steps": spec.steps.len() }),
        );
        Ok(id)
    }

    /// Transitions a PENDING workflow to RUNNING and begins execution.
    pub async fn start(&self, id: WorkflowId) -> Result<(), EngineError> {
        let dispatch = self.dispatch_lock(id);
        let _guard = dispatch.lock().await;

        let (row, _, _) = self
            .inner
            .store
            .load_workflow(id)?
            .ok_or_else(|| EngineError::invalid_state(format!("workflow {} not found", id)))?;
        if row.status != WorkflowStatus::Pending {
            return Err(EngineError::invalid_state(format!(
                "cannot start workflow in status {}",
                row.status
            )));
        }

        let spec = WorkflowSpec::from_yaml(&row.spec_yaml)?;
        self.inner
            .store
            .update_workflow_status(id, WorkflowStatus::Running, None, None)?;

        let mut state = ExecutionState::new();
        state.status = WorkflowStatus::Running;
        self.spawn_executor(id, spec, state);
        Ok(())
    }

    /// Applies a human decision to a PAUSED workflow: APPROVED continues
    /// from the paused step, REJECTED rolls completed work back. Fails
    /// with `InvalidState` for any other workflow status, which also makes
    /// a repeated resume after the first was accepted harmless.
    pub async fn resume(
        &self,
        id: WorkflowId,
        decision: ApprovalDecision,
        approver: &str,
        rationale: Option<&str>,
    ) -> Result<(), EngineError> {
        let dispatch = self.dispatch_lock(id);
        let _guard = dispatch.lock().await;

        let (row, steps, compensations) = self
            .inner
            .store
            .load_workflow(id)?
            .ok_or_else(|| EngineError::invalid_state(format!("workflow {} not found", id)))?;
        if row.status != WorkflowStatus::Paused {
            return Err(EngineError::invalid_state(format!(
                "cannot resume workflow in status {}",
                row.status
            )));
        }

        let recovered = rebuild_state(&row, &steps, &compensations);
        let paused_step = recovered.paused_step.ok_or_else(|| {
            EngineError::invalid_state("paused workflow has no paused step checkpoint")
        })?;

        self.inner
            .approvals
            .record_decision(id, &paused_step, decision, approver, rationale)?;
        self.inner.audit.record(
            Some(id),
            "approval_decided",
            approver,
            json!({ "step": paused_step, "decision": format!("{:?}", decision), "rationale": rationale }),
        );

        let spec = WorkflowSpec::from_yaml(&row.spec_yaml)?;
        let mut state = recovered.state;

        match decision {
            ApprovalDecision::Approved => {
                self.inner
                    .store
                    .update_workflow_status(id, WorkflowStatus::Running, None, None)?;
                state.status = WorkflowStatus::Running;
                self.spawn_executor(id, spec, state);
            }
            ApprovalDecision::Rejected => {
                let cancel = Arc::new(AtomicBool::new(false));
                let executor =
                    WorkflowExecutor::new(Arc::clone(&self.inner), id, spec, state, cancel);
                executor.run_rejected(&paused_step, approver).await;
            }
        }
        Ok(())
    }

    /// Requests cancellation of a RUNNING or PAUSED workflow. For a live
    /// executor the flag is honored at the next step boundary; a paused
    /// workflow is rolled back immediately.
    pub async fn cancel(&self, id: WorkflowId, reason: &str) -> Result<(), EngineError> {
        let dispatch = self.dispatch_lock(id);
        let _guard = dispatch.lock().await;

        let (row, steps, compensations) = self
            .inner
            .store
            .load_workflow(id)?
            .ok_or_else(|| EngineError::invalid_state(format!("workflow {} not found", id)))?;
        if !matches!(row.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
            return Err(EngineError::invalid_state(format!(
                "cannot cancel workflow in status {}",
                row.status
            )));
        }

        self.inner.audit.record(
            Some(id),
            "cancel_requested",
            "operator",
            json!({ "reason": reason }),
        );

        let flagged_executor = {
            let active = self.lock_active();
            match active.get(&id) {
                Some(handle) => {
                    handle.cancel.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if flagged_executor {
            return Ok(());
        }

        // No executor to interrupt (paused, or recovered but not running):
        // roll back inline.
        let recovered = rebuild_state(&row, &steps, &compensations);
        let spec = WorkflowSpec::from_yaml(&row.spec_yaml)?;
        let cancel = Arc::new(AtomicBool::new(true));
        let executor =
            WorkflowExecutor::new(Arc::clone(&self.inner), id, spec, recovered.state, cancel);
        executor.run_canceled(reason).await;
        Ok(())
    }

    /// Current status, completed steps, and error message of a workflow.
    pub fn status(&self, id: WorkflowId) -> Result<WorkflowSnapshot, EngineError> {
        let (row, steps, compensations) = self
            .inner
            .store
            .load_workflow(id)?
            .ok_or_else(|| EngineError::invalid_state(format!("workflow {} not found", id)))?;
        let recovered = rebuild_state(&row, &steps, &compensations);
        Ok(WorkflowSnapshot {
            status: row.status,
            completed_steps: recovered.state.completed_steps,
            error_message: row.error_message,
        })
    }

    /// Scans persistence for RUNNING and PAUSED workflows and reattaches
    /// them: RUNNING workflows get a fresh executor that continues from
    /// the last checkpoint (completed steps are never re-executed), PAUSED
    /// workflows wait for `resume`. Returns the reattached ids.
    pub async fn recover_on_startup(&self) -> Result<Vec<WorkflowId>, EngineError> {
        let rows = self
            .inner
            .store
            .list_by_status(&[WorkflowStatus::Running, WorkflowStatus::Paused])?;

        let mut recovered = Vec::new();
        for listed in rows {
            let id = listed.id;
            let dispatch = self.dispatch_lock(id);
            let _guard = dispatch.lock().await;

            // Re-read under the dispatch lock: the listing may be stale by
            // the time this workflow's turn comes.
            let Some((row, steps, compensations)) = self.inner.store.load_workflow(id)? else {
                continue;
            };
            if !matches!(row.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
                continue;
            }

            let spec = match WorkflowSpec::from_yaml(&row.spec_yaml) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(workflow = %id, error = %e, "recovery: stored spec unreadable");
                    self.inner.store.update_workflow_status(
                        id,
                        WorkflowStatus::Failed,
                        Some(&format!("recovery failed: {}", e)),
                        Some(chrono::Utc::now()),
                    )?;
                    continue;
                }
            };

            let rebuilt = rebuild_state(&row, &steps, &compensations);
            info!(
                workflow = %id,
                status = %row.status,
                completed = rebuilt.state.completed_steps.len(),
                pending_compensations = rebuilt.state.compensation_stack.len(),
                "recovered workflow from checkpoint store"
            );
            self.inner.audit.record(
                Some(id),
                "workflow_recovered",
                "engine",
                json!({
                    "status": row.status.as_str(),
                    "completed_steps": rebuilt.state.completed_steps,
                }),
            );

            if row.status == WorkflowStatus::Running && !self.has_live_executor(id) {
                self.spawn_executor(id, spec, rebuilt.state);
            }
            recovered.push(id);
        }
        Ok(recovered)
    }

    /// Waits until the workflow's executor settles (completes, pauses, or
    /// fails). A workflow with no live executor returns immediately.
    pub async fn join(&self, id: WorkflowId) -> Result<(), EngineError> {
        let handle = {
            let mut active = self.lock_active();
            active.remove(&id)
        };
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }
        Ok(())
    }

    fn spawn_executor(&self, id: WorkflowId, spec: WorkflowSpec, state: ExecutionState) {
        let cancel = Arc::new(AtomicBool::new(false));
        let executor = WorkflowExecutor::new(
            Arc::clone(&self.inner),
            id,
            spec,
            state,
            Arc::clone(&cancel),
        );
        let task = tokio::spawn(executor.run());
        self.lock_active().insert(id, WorkflowHandle { cancel, task });
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<WorkflowId, WorkflowHandle>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The per-workflow dispatch mutex, created on first use.
    fn dispatch_lock(&self, id: WorkflowId) -> Arc<AsyncMutex<()>> {
        let mut dispatch = self
            .inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(dispatch.entry(id).or_default())
    }

    fn has_live_executor(&self, id: WorkflowId) -> bool {
        self.lock_active()
            .get(&id)
            .map(|handle| !handle.task.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
