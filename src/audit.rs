//! Append-only JSONL audit trail.
//!
//! Every decision and state transition in the control plane is recorded as
//! one JSON object per line with:
//! - Monotonic sequence numbers for ordering
//! - ISO 8601 timestamps with microsecond precision
//! - The acting principal and owning workflow for correlation
//! - Sanitized payloads: values under sensitive keys are masked before
//!   anything reaches disk

use crate::domain::WorkflowId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Key patterns whose values are never written in clear text.
const SENSITIVE_KEY_PATTERNS: &[&str] = &["token", "key", "password", "secret", "credential"];

const MASK: &str = "***";

/// A single audit entry in JSONL format.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence number, unique for this log's lifetime.
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds.
    pub ts: String,
    /// Owning workflow, when the event concerns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Event kind, e.g. `step_completed` or `policy_evaluated`.
    pub event: String,
    /// The acting principal or component.
    pub actor: String,
    /// Sanitized structured payload.
    pub data: Value,
}

/// Append-only audit logger. Thread-safe; write failures are swallowed so
/// auditing can never take down an executor mid-rollback.
pub struct AuditLog {
    seq: AtomicU64,
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLog {
    /// Opens (or creates) the audit log at `<dir>/audit.jsonl`.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("audit.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            seq: AtomicU64::new(0),
            file: Mutex::new(file),
            path,
        })
    }

    /// The file this log appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends one event with a sanitized payload.
    pub fn record(
        &self,
        workflow_id: Option<WorkflowId>,
        event: &str,
        actor: &str,
        data: Value,
    ) {
        let entry = AuditEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            workflow_id: workflow_id.map(|id| id.to_string()),
            event: event.to_string(),
            actor: actor.to_string(),
            data: mask_sensitive(data),
        };

        if let Ok(mut file) = self.file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Replaces values under sensitive keys with a fixed mask, recursively.
pub fn mask_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if is_sensitive_key(&k) {
                        (k, Value::String(MASK.to_string()))
                    } else {
                        (k, mask_sensitive(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(mask_sensitive).collect()),
        other => other,
    }
}
