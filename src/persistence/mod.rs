//! Durable checkpoint store over embedded SQLite.
//!
//! Source of truth for crash recovery. Three core tables (`workflows`,
//! `workflow_steps`, `compensation_log`) hold workflow state, per-step
//! checkpoints, and the compensation journal; an auxiliary `approvals`
//! table backs the human approval manager. Journaling is WAL with
//! `synchronous=NORMAL` so reads stay concurrent and a crash never tears a
//! transaction. Every state-changing operation is a single transaction
//! that succeeds or leaves no observable effect.

use crate::domain::{
    format_timestamp, ApprovalState, CompensationIntent, EngineError, StepStatus, TimestampUtc,
    WorkflowId, WorkflowSpec, WorkflowStatus,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows(
  id            TEXT PRIMARY KEY,
  name          TEXT NOT NULL,
  version       TEXT NOT NULL,
  owner         TEXT NOT NULL,
  status        TEXT NOT NULL,
  spec_yaml     TEXT NOT NULL,
  created_at    TEXT NOT NULL,
  updated_at    TEXT NOT NULL,
  completed_at  TEXT,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS workflow_steps(
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_id   TEXT NOT NULL REFERENCES workflows(id),
  step_name     TEXT NOT NULL,
  status        TEXT NOT NULL,
  inputs_json   TEXT,
  outputs_json  TEXT,
  started_at    TEXT NOT NULL,
  completed_at  TEXT,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS compensation_log(
  id                   INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_id          TEXT NOT NULL REFERENCES workflows(id),
  step_name            TEXT NOT NULL,
  compensation_action  TEXT NOT NULL,
  inputs_json          TEXT,
  executed_at          TEXT,
  success              INTEGER,
  error_message        TEXT
);

CREATE TABLE IF NOT EXISTS approvals(
  workflow_id   TEXT NOT NULL REFERENCES workflows(id),
  step_name     TEXT NOT NULL,
  message       TEXT NOT NULL,
  requested_at  TEXT NOT NULL,
  state         TEXT NOT NULL,
  approver      TEXT,
  decided_at    TEXT,
  rationale     TEXT,
  PRIMARY KEY (workflow_id, step_name)
);

CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
CREATE INDEX IF NOT EXISTS idx_steps_wf         ON workflow_steps(workflow_id);
CREATE INDEX IF NOT EXISTS idx_comp_wf          ON compensation_log(workflow_id);
"#;

/// One row of the `workflows` table.
#[derive(Debug, Clone)]
pub struct WorkflowRow {
    pub id: WorkflowId,
    pub name: String,
    pub version: String,
    pub owner: String,
    pub status: WorkflowStatus,
    pub spec_yaml: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

/// One row of the `workflow_steps` table.
#[derive(Debug, Clone)]
pub struct StepRow {
    pub id: i64,
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub status: StepStatus,
    pub inputs_json: Option<String>,
    pub outputs_json: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

impl StepRow {
    /// Parses the persisted outputs back into a JSON map.
    pub fn outputs(&self) -> Option<Map<String, Value>> {
        self.outputs_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
    }
}

/// One row of the `compensation_log` table.
#[derive(Debug, Clone)]
pub struct CompensationRow {
    pub id: i64,
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub compensation_action: String,
    pub inputs_json: Option<String>,
    pub executed_at: Option<String>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
}

impl CompensationRow {
    /// Rebuilds the intent form from the persisted row.
    pub fn intent(&self) -> CompensationIntent {
        let inputs = self
            .inputs_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        CompensationIntent {
            capability: self.compensation_action.clone(),
            inputs,
        }
    }
}

/// One row of the `approvals` table.
#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub message: String,
    pub requested_at: String,
    pub state: ApprovalState,
    pub approver: Option<String>,
    pub decided_at: Option<String>,
    pub rationale: Option<String>,
}

/// Everything needed to checkpoint one step atomically.
#[derive(Debug)]
pub struct StepCheckpoint<'a> {
    pub workflow_id: WorkflowId,
    pub step_name: &'a str,
    pub status: StepStatus,
    pub inputs: Option<&'a Map<String, Value>>,
    pub outputs: Option<&'a Map<String, Value>>,
    pub started_at: TimestampUtc,
    pub completed_at: Option<TimestampUtc>,
    pub error_message: Option<&'a str>,
    /// Intent-form compensation written as a pending-undo placeholder in
    /// the same transaction, so a crash between the two is impossible.
    pub pending_compensation: Option<&'a CompensationIntent>,
    /// Terminal workflow status written alongside the step row, if any.
    pub workflow_status: Option<WorkflowStatus>,
}

/// The durable checkpoint store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (or creates) the database at `path` with WAL journaling,
    /// `synchronous=NORMAL`, foreign keys on, and 0600 permissions.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::persistence(format!("create db directory: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|e| EngineError::persistence(format!("set db permissions: {}", e)))?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a freshly submitted workflow in PENDING status with its
    /// spec serialized verbatim.
    pub fn create_workflow(
        &self,
        id: WorkflowId,
        spec: &WorkflowSpec,
        spec_yaml: &str,
    ) -> Result<(), EngineError> {
        let now = format_timestamp(Utc::now());
        self.lock().execute(
            "INSERT INTO workflows (id, name, version, owner, status, spec_yaml, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id.to_string(),
                spec.name,
                spec.version,
                spec.owner,
                WorkflowStatus::Pending.as_str(),
                spec_yaml,
                now,
            ],
        )?;
        Ok(())
    }

    /// Updates a workflow's status, error message, and completion time in
    /// one transaction.
    pub fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        error_message: Option<&str>,
        completed_at: Option<TimestampUtc>,
    ) -> Result<(), EngineError> {
        let now = format_timestamp(Utc::now());
        let changed = self.lock().execute(
            "UPDATE workflows
             SET status = ?2,
                 updated_at = ?3,
                 error_message = COALESCE(?4, error_message),
                 completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                now,
                error_message,
                completed_at.map(format_timestamp),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::persistence(format!(
                "workflow {} not found for status update",
                id
            )));
        }
        Ok(())
    }

    /// Checkpoints one step: inserts the step row, optionally the pending
    /// compensation placeholder, and advances the owning workflow's
    /// `updated_at` (and status, if given), all in a single transaction.
    pub fn checkpoint_step(&self, ckpt: StepCheckpoint<'_>) -> Result<(), EngineError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());

        tx.execute(
            "INSERT INTO workflow_steps
               (workflow_id, step_name, status, inputs_json, outputs_json,
                started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ckpt.workflow_id.to_string(),
                ckpt.step_name,
                ckpt.status.as_str(),
                ckpt.inputs
                    .map(|m| serde_json::to_string(&Value::Object(m.clone())))
                    .transpose()?,
                ckpt.outputs
                    .map(|m| serde_json::to_string(&Value::Object(m.clone())))
                    .transpose()?,
                format_timestamp(ckpt.started_at),
                ckpt.completed_at.map(format_timestamp),
                ckpt.error_message,
            ],
        )?;

        if let Some(intent) = ckpt.pending_compensation {
            tx.execute(
                "INSERT INTO compensation_log
                   (workflow_id, step_name, compensation_action, inputs_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    ckpt.workflow_id.to_string(),
                    ckpt.step_name,
                    intent.capability,
                    serde_json::to_string(&Value::Object(intent.inputs.clone()))?,
                ],
            )?;
        }

        match ckpt.workflow_status {
            Some(status) => {
                tx.execute(
                    "UPDATE workflows SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![ckpt.workflow_id.to_string(), status.as_str(), now],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE workflows SET updated_at = ?2 WHERE id = ?1",
                    params![ckpt.workflow_id.to_string(), now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Appends an already-executed compensation entry. Used for
    /// closure-form compensations that never had a pending placeholder.
    pub fn log_compensation(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        intent: Option<&CompensationIntent>,
        executed_at: TimestampUtc,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        self.lock().execute(
            "INSERT INTO compensation_log
               (workflow_id, step_name, compensation_action, inputs_json,
                executed_at, success, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                workflow_id.to_string(),
                step_name,
                intent.map(|i| i.capability.as_str()).unwrap_or("<closure>"),
                intent
                    .map(|i| serde_json::to_string(&Value::Object(i.inputs.clone())))
                    .transpose()?,
                format_timestamp(executed_at),
                success,
                error_message,
            ],
        )?;
        Ok(())
    }

    /// Marks a pending compensation placeholder as executed.
    pub fn record_compensation_result(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        executed_at: TimestampUtc,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), EngineError> {
        let changed = self.lock().execute(
            "UPDATE compensation_log
             SET executed_at = ?3, success = ?4, error_message = ?5
             WHERE workflow_id = ?1 AND step_name = ?2 AND executed_at IS NULL",
            params![
                workflow_id.to_string(),
                step_name,
                format_timestamp(executed_at),
                success,
                error_message,
            ],
        )?;
        if changed == 0 {
            // No placeholder existed; record the execution as a fresh entry.
            self.log_compensation(
                workflow_id,
                step_name,
                None,
                executed_at,
                success,
                error_message,
            )?;
        }
        Ok(())
    }

    /// Loads one workflow with its step checkpoints and compensation log,
    /// in insertion order.
    #[allow(clippy::type_complexity)]
    pub fn load_workflow(
        &self,
        id: WorkflowId,
    ) -> Result<Option<(WorkflowRow, Vec<StepRow>, Vec<CompensationRow>)>, EngineError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, version, owner, status, spec_yaml,
                        created_at, updated_at, completed_at, error_message
                 FROM workflows WHERE id = ?1",
                params![id.to_string()],
                map_workflow_row,
            )
            .optional()?;

        let Some(workflow) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, step_name, status, inputs_json, outputs_json,
                    started_at, completed_at, error_message
             FROM workflow_steps WHERE workflow_id = ?1 ORDER BY id ASC",
        )?;
        let steps = stmt
            .query_map(params![id.to_string()], map_step_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, step_name, compensation_action, inputs_json,
                    executed_at, success, error_message
             FROM compensation_log WHERE workflow_id = ?1 ORDER BY id ASC",
        )?;
        let compensations = stmt
            .query_map(params![id.to_string()], map_compensation_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((workflow, steps, compensations)))
    }

    /// Lists workflows whose status is in `statuses`.
    pub fn list_by_status(
        &self,
        statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowRow>, EngineError> {
        let conn = self.lock();
        let mut rows = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, name, version, owner, status, spec_yaml,
                    created_at, updated_at, completed_at, error_message
             FROM workflows WHERE status = ?1 ORDER BY created_at ASC",
        )?;
        for status in statuses {
            let found = stmt
                .query_map(params![status.as_str()], map_workflow_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.extend(found);
        }
        Ok(rows)
    }

    /// Persists (or refreshes) a PENDING approval record for a gate.
    pub fn insert_approval(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        self.lock().execute(
            "INSERT INTO approvals (workflow_id, step_name, message, requested_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workflow_id, step_name) DO UPDATE SET
               message = excluded.message,
               requested_at = excluded.requested_at
             WHERE approvals.state = 'PENDING'",
            params![
                workflow_id.to_string(),
                step_name,
                message,
                format_timestamp(Utc::now()),
                ApprovalState::Pending.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Records a decision. Idempotent for repeated identical decisions;
    /// a conflicting decision fails with `ApprovalConflict`.
    pub fn decide_approval(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        state: ApprovalState,
        approver: &str,
        rationale: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT state FROM approvals WHERE workflow_id = ?1 AND step_name = ?2",
                params![workflow_id.to_string(), step_name],
                |row| row.get(0),
            )
            .optional()?;

        match existing.as_deref() {
            None => {
                // Out-of-band decision with no prior webhook request.
                tx.execute(
                    "INSERT INTO approvals
                       (workflow_id, step_name, message, requested_at, state,
                        approver, decided_at, rationale)
                     VALUES (?1, ?2, '', ?3, ?4, ?5, ?3, ?6)",
                    params![
                        workflow_id.to_string(),
                        step_name,
                        format_timestamp(Utc::now()),
                        state.as_str(),
                        approver,
                        rationale,
                    ],
                )?;
            }
            Some("PENDING") => {
                tx.execute(
                    "UPDATE approvals
                     SET state = ?3, approver = ?4, decided_at = ?5, rationale = ?6
                     WHERE workflow_id = ?1 AND step_name = ?2",
                    params![
                        workflow_id.to_string(),
                        step_name,
                        state.as_str(),
                        approver,
                        format_timestamp(Utc::now()),
                        rationale,
                    ],
                )?;
            }
            Some(current) if current == state.as_str() => {
                // Repeated identical decision: accepted silently.
            }
            Some(current) => {
                return Err(EngineError::ApprovalConflict {
                    step: step_name.to_string(),
                    message: format!("already {}, cannot record {}", current, state.as_str()),
                });
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Reads PENDING approval records, optionally narrowed to one step.
    pub fn pending_approvals(
        &self,
        workflow_id: WorkflowId,
        step_name: Option<&str>,
    ) -> Result<Vec<ApprovalRow>, EngineError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT workflow_id, step_name, message, requested_at, state,
                    approver, decided_at, rationale
             FROM approvals
             WHERE workflow_id = ?1 AND state = 'PENDING'
               AND (?2 IS NULL OR step_name = ?2)
             ORDER BY requested_at ASC",
        )?;
        let rows = stmt
            .query_map(params![workflow_id.to_string(), step_name], map_approval_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The approval record for one gate, whatever its state.
    pub fn latest_approval(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
    ) -> Result<Option<ApprovalRow>, EngineError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT workflow_id, step_name, message, requested_at, state,
                        approver, decided_at, rationale
                 FROM approvals WHERE workflow_id = ?1 AND step_name = ?2",
                params![workflow_id.to_string(), step_name],
                map_approval_row,
            )
            .optional()?;
        Ok(row)
    }
}

fn map_workflow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRow> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    Ok(WorkflowRow {
        id: WorkflowId::from_string(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(1)?,
        version: row.get(2)?,
        owner: row.get(3)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        spec_yaml: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        completed_at: row.get(8)?,
        error_message: row.get(9)?,
    })
}

fn map_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    let workflow_id: String = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(StepRow {
        id: row.get(0)?,
        workflow_id: WorkflowId::from_string(&workflow_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        step_name: row.get(2)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        inputs_json: row.get(4)?,
        outputs_json: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error_message: row.get(8)?,
    })
}

fn map_compensation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompensationRow> {
    let workflow_id: String = row.get(1)?;
    let success: Option<i64> = row.get(6)?;
    Ok(CompensationRow {
        id: row.get(0)?,
        workflow_id: WorkflowId::from_string(&workflow_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        step_name: row.get(2)?,
        compensation_action: row.get(3)?,
        inputs_json: row.get(4)?,
        executed_at: row.get(5)?,
        success: success.map(|v| v != 0),
        error_message: row.get(7)?,
    })
}

fn map_approval_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRow> {
    let workflow_id: String = row.get(0)?;
    let state: String = row.get(4)?;
    Ok(ApprovalRow {
        workflow_id: WorkflowId::from_string(&workflow_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        step_name: row.get(1)?,
        message: row.get(2)?,
        requested_at: row.get(3)?,
        state: state.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        approver: row.get(5)?,
        decided_at: row.get(6)?,
        rationale: row.get(7)?,
    })
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
