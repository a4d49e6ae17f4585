//! Workflow and step specifications plus the in-memory execution state.
//!
//! A workflow spec is the declarative YAML document a caller submits; it is
//! persisted verbatim and never mutated. The execution state is owned
//! exclusively by the workflow engine and checkpointed to the store at
//! every step boundary.

use super::errors::EngineError;
use super::types::{AuditLevel, RiskLevel, StepKind, TimestampUtc, WorkflowStatus};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

fn default_max_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// Explicit compensation attached to a step in the workflow spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompensation {
    pub capability: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// One node in a workflow: an action, a human approval gate, or a
/// parallel group of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the workflow, including parallel sub-steps.
    pub name: String,
    #[serde(default)]
    pub kind: StepKind,
    /// Capability id for ACTION steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Principal id the step runs under; falls back to the workflow owner.
    #[serde(default, alias = "agent", skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Literal values or `{{step_name.output_key}}` template references.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<StepCompensation>,
    /// Retries after the first attempt; two retries means three attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Overrides the capability's registered risk when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Per-attempt timeout; an elapsed timeout counts as a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Sub-steps of a PARALLEL group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
}

/// Tags and audit level carried alongside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub audit_level: AuditLevel,
}

/// A declarative workflow specification, one transactional unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Roll back completed steps when the workflow fails. Default true.
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    /// Parses a spec from its YAML form and validates it.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let spec: Self = serde_yaml::from_str(yaml).map_err(|e| EngineError::SpecValidation {
            violations: vec![format!("invalid workflow yaml: {}", e)],
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Serializes the spec back to YAML for verbatim persistence.
    pub fn to_yaml(&self) -> Result<String, EngineError> {
        serde_yaml::to_string(self).map_err(|e| EngineError::SpecValidation {
            violations: vec![format!("unserializable workflow spec: {}", e)],
        })
    }

    /// Structural validation: unique names, resolvable dependencies, no
    /// cycles, and per-kind field requirements.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut violations = Vec::new();

        if self.name.is_empty() {
            violations.push("workflow name must not be empty".to_string());
        }
        if self.version.is_empty() {
            violations.push("workflow version must not be empty".to_string());
        }
        if self.steps.is_empty() {
            violations.push("workflow must declare at least one step".to_string());
        }

        let mut names = HashSet::new();
        for step in self.all_steps() {
            if step.name.is_empty() {
                violations.push("step names must not be empty".to_string());
            } else if !names.insert(step.name.as_str()) {
                violations.push(format!("duplicate step name '{}'", step.name));
            }
        }

        for step in &self.steps {
            Self::validate_step(step, false, &names, &mut violations);
        }

        if self.has_dependency_cycle() {
            violations.push("depends_on forms a cycle".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::SpecValidation { violations })
        }
    }

    fn validate_step(
        step: &StepSpec,
        nested: bool,
        names: &HashSet<&str>,
        violations: &mut Vec<String>,
    ) {
        match step.kind {
            StepKind::Action => {
                if step.capability.is_none() {
                    violations.push(format!("ACTION step '{}' must name a capability", step.name));
                }
                if !step.steps.is_empty() {
                    violations.push(format!(
                        "ACTION step '{}' must not declare sub-steps",
                        step.name
                    ));
                }
            }
            StepKind::HumanApproval => {
                if step.capability.is_some() {
                    violations.push(format!(
                        "HUMAN_APPROVAL step '{}' must not name a capability",
                        step.name
                    ));
                }
                if nested {
                    violations.push(format!(
                        "approval gate '{}' cannot appear inside a PARALLEL group",
                        step.name
                    ));
                }
            }
            StepKind::Parallel => {
                if nested {
                    violations.push(format!(
                        "PARALLEL group '{}' cannot be nested inside another group",
                        step.name
                    ));
                } else if step.steps.is_empty() {
                    violations.push(format!(
                        "PARALLEL group '{}' must declare sub-steps",
                        step.name
                    ));
                }
                for sub in &step.steps {
                    if !sub.depends_on.is_empty() {
                        violations.push(format!(
                            "sub-step '{}' must not declare depends_on; the group is the unit",
                            sub.name
                        ));
                    }
                    Self::validate_step(sub, true, names, violations);
                }
            }
        }

        for dep in &step.depends_on {
            if !names.contains(dep.as_str()) {
                violations.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, dep
                ));
            }
            if dep == &step.name {
                violations.push(format!("step '{}' depends on itself", step.name));
            }
        }
    }

    fn has_dependency_cycle(&self) -> bool {
        // Steps execute in declaration order, so it is enough to detect a
        // dependency on a step declared at or after the dependent.
        let order: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&dep_idx) = order.get(dep.as_str()) {
                    if dep_idx >= i {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Iterates every step including parallel sub-steps.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps
            .iter()
            .flat_map(|s| std::iter::once(s).chain(s.steps.iter()))
    }

    /// Finds a top-level step by name.
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Intent-form compensation: a compensating capability plus its resolved
/// inputs. Always persistable; authoritative for deterministic recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationIntent {
    pub capability: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// An in-memory undo callback supplied by a handler at execution time.
/// Best-effort only: it does not survive a crash.
pub type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One entry on a workflow's compensation stack.
///
/// The intent form is re-enacted on recovery by invoking its capability;
/// the closure form is an optimization used only while still in memory.
pub struct CompensationEntry {
    pub step_name: String,
    pub intent: Option<CompensationIntent>,
    pub undo: Option<UndoFn>,
}

impl std::fmt::Debug for CompensationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationEntry")
            .field("step_name", &self.step_name)
            .field("intent", &self.intent)
            .field("undo", &self.undo.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// Mutable execution state of one workflow. Owned exclusively by that
/// workflow's executor; everyone else reads immutable snapshots or the
/// persistence layer.
#[derive(Debug)]
pub struct ExecutionState {
    pub status: WorkflowStatus,
    /// `step_name.output_key` → value, grown monotonically.
    pub step_outputs: HashMap<String, Value>,
    /// Names of steps that finished (or paused at an approval gate),
    /// in completion order.
    pub completed_steps: Vec<String>,
    /// LIFO stack of captured compensations.
    pub compensation_stack: Vec<CompensationEntry>,
    pub started_at: TimestampUtc,
    pub updated_at: TimestampUtc,
    pub completed_at: Option<TimestampUtc>,
    pub error_message: Option<String>,
}

impl ExecutionState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: WorkflowStatus::Pending,
            step_outputs: HashMap::new(),
            completed_steps: Vec::new(),
            compensation_stack: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_completed(&self, step_name: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_name)
    }

    /// Merges a completed step's outputs under `step_name.output_key`.
    /// Once written, outputs are immutable.
    pub fn merge_outputs(&mut self, step_name: &str, outputs: &Map<String, Value>) {
        for (key, value) in outputs {
            self.step_outputs
                .entry(format!("{}.{}", step_name, key))
                .or_insert_with(|| value.clone());
        }
    }

    pub fn record_completed(&mut self, step_name: &str) {
        if !self.is_completed(step_name) {
            self.completed_steps.push(step_name.to_string());
        }
        self.updated_at = Utc::now();
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/workflow_tests.rs"]
mod tests;
