//! Reconstruction of execution state from the checkpoint store.
//!
//! Replays the persisted step rows and pending compensation entries into a
//! fresh `ExecutionState` so a recovered executor continues exactly where
//! the crashed one stopped. Completed steps are never re-executed; the
//! compensation stack is rebuilt from intent-form rows in their original
//! insertion order. Closure-form compensations do not survive a crash.

use crate::domain::{CompensationEntry, ExecutionState, StepStatus};
use crate::persistence::{CompensationRow, StepRow, WorkflowRow};

/// The state rebuilt from persistence plus the step the workflow is
/// paused at, if any.
#[derive(Debug)]
pub struct RecoveredState {
    pub state: ExecutionState,
    pub paused_step: Option<String>,
}

/// Replays persisted rows into an execution state.
pub fn rebuild_state(
    row: &WorkflowRow,
    steps: &[StepRow],
    compensations: &[CompensationRow],
) -> RecoveredState {
    let mut state = ExecutionState::new();
    state.status = row.status;
    state.error_message = row.error_message.clone();

    let mut paused_step = None;
    for step in steps {
        match step.status {
            StepStatus::Completed => {
                if let Some(outputs) = step.outputs() {
                    state.merge_outputs(&step.step_name, &outputs);
                }
                state.record_completed(&step.step_name);
                if paused_step.as_deref() == Some(step.step_name.as_str()) {
                    // A later completion supersedes the pause checkpoint.
                    paused_step = None;
                }
            }
            StepStatus::Paused => {
                paused_step = Some(step.step_name.clone());
            }
            StepStatus::Pending | StepStatus::Running | StepStatus::Failed => {}
        }
    }

    for comp in compensations {
        if comp.executed_at.is_none() {
            state.compensation_stack.push(CompensationEntry {
                step_name: comp.step_name.clone(),
                intent: Some(comp.intent()),
                undo: None,
            });
        }
    }

    RecoveredState { state, paused_step }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{WorkflowId, WorkflowStatus};
    use serde_json::json;

    fn workflow_row(status: WorkflowStatus) -> WorkflowRow {
        WorkflowRow {
            id: WorkflowId::new(),
            name: "wf".to_string(),
            version: "0.1.0".to_string(),
            owner: "tester".to_string(),
            status,
            spec_yaml: String::new(),
            created_at: "2026-08-01T00:00:00.000000Z".to_string(),
            updated_at: "2026-08-01T00:00:00.000000Z".to_string(),
            completed_at: None,
            error_message: None,
        }
    }

    fn step_row(id: i64, wf: WorkflowId, name: &str, status: StepStatus, outputs: Option<&str>) -> StepRow {
        StepRow {
            id,
            workflow_id: wf,
            step_name: name.to_string(),
            status,
            inputs_json: None,
            outputs_json: outputs.map(|s| s.to_string()),
            started_at: "2026-08-01T00:00:00.000000Z".to_string(),
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn completed_rows_rebuild_outputs_and_order() {
        let row = workflow_row(WorkflowStatus::Running);
        let steps = vec![
            step_row(1, row.id, "a", StepStatus::Completed, Some(r#"{"path":"/tmp/a"}"#)),
            step_row(2, row.id, "b", StepStatus::Completed, Some(r#"{"n":2}"#)),
        ];
        let recovered = rebuild_state(&row, &steps, &[]);
        assert_eq!(recovered.state.completed_steps, vec!["a", "b"]);
        assert_eq!(
            recovered.state.step_outputs.get("a.path"),
            Some(&json!("/tmp/a"))
        );
        assert_eq!(recovered.state.step_outputs.get("b.n"), Some(&json!(2)));
        assert!(recovered.paused_step.is_none());
    }

    #[test]
    fn paused_row_marks_the_gate() {
        let row = workflow_row(WorkflowStatus::Paused);
        let steps = vec![
            step_row(1, row.id, "a", StepStatus::Completed, None),
            step_row(2, row.id, "gate", StepStatus::Paused, None),
        ];
        let recovered = rebuild_state(&row, &steps, &[]);
        assert_eq!(recovered.paused_step.as_deref(), Some("gate"));
        assert!(!recovered.state.is_completed("gate"));
    }

    #[test]
    fn later_completion_supersedes_the_pause_checkpoint() {
        let row = workflow_row(WorkflowStatus::Running);
        let steps = vec![
            step_row(1, row.id, "gate", StepStatus::Paused, None),
            step_row(2, row.id, "gate", StepStatus::Completed, None),
        ];
        let recovered = rebuild_state(&row, &steps, &[]);
        assert!(recovered.paused_step.is_none());
        assert!(recovered.state.is_completed("gate"));
    }

    #[test]
    fn pending_compensations_rebuild_the_stack_in_insertion_order() {
        let row = workflow_row(WorkflowStatus::Running);
        let comps = vec![
            CompensationRow {
                id: 1,
                workflow_id: row.id,
                step_name: "a".to_string(),
                compensation_action: "io.fs.delete_file".to_string(),
                inputs_json: Some(r#"{"path":"/tmp/a"}"#.to_string()),
                executed_at: None,
                success: None,
                error_message: None,
            },
            CompensationRow {
                id: 2,
                workflow_id: row.id,
                step_name: "b".to_string(),
                compensation_action: "io.fs.delete_file".to_string(),
                inputs_json: Some(r#"{"path":"/tmp/b"}"#.to_string()),
                executed_at: Some("2026-08-01T00:00:01.000000Z".to_string()),
                success: Some(true),
                error_message: None,
            },
        ];
        let recovered = rebuild_state(&row, &[], &comps);
        // Only the pending entry is rebuilt; the executed one stays history.
        assert_eq!(recovered.state.compensation_stack.len(), 1);
        let entry = &recovered.state.compensation_stack[0];
        assert_eq!(entry.step_name, "a");
        assert_eq!(
            entry.intent.as_ref().unwrap().capability,
            "io.fs.delete_file"
        );
        assert!(entry.undo.is_none());
    }
}
