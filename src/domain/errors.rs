//! Error types for the workflow control plane.
//!
//! One enum covers the whole taxonomy so callers can match on the kind of
//! failure: validation errors are synchronous and fatal to their operation,
//! step-level errors feed the rollback path, and persistence errors are
//! fatal to the workflow because rollback itself needs the store.

use std::fmt::{Display, Formatter};

/// Errors raised by the registry, policy engine, persistence layer,
/// approval manager, and workflow engine.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// A capability or workflow spec violates its schema or a risk
    /// consistency invariant. Carries every violated rule, not just the first.
    SpecValidation { violations: Vec<String> },
    /// The policy rule set could not be loaded or parsed.
    PolicyLoad { message: String },
    /// A step input references an output that does not exist. Non-retryable.
    TemplateResolution { step: String, reference: String },
    /// No capability registered under this id.
    CapabilityNotFound { id: String },
    /// The capability exists but its lifecycle state forbids execution.
    CapabilityFrozen { id: String, state: String },
    /// The policy engine returned DENY for this step.
    PolicyDenied { step: String, capability: String },
    /// A paused step was resolved with a rejection.
    ApprovalRejected { step: String, approver: String },
    /// An approval gate timed out; treated as a rejection.
    ApprovalTimeout { step: String },
    /// A decision conflicts with one already recorded.
    ApprovalConflict { step: String, message: String },
    /// The capability handler failed. Subject to the retry policy.
    StepExecution { step: String, message: String },
    /// A compensation failed during rollback. Rollback continues.
    Compensation { step: String, message: String },
    /// The checkpoint database rejected a write. Fatal to the workflow.
    Persistence { message: String },
    /// The requested transition does not apply to the workflow's state.
    InvalidState { message: String },
}

impl EngineError {
    /// Only handler failures are retried; everything else fails the step
    /// (or the operation) immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepExecution { .. })
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpecValidation { violations } => {
                write!(f, "spec validation failed: {}", violations.join("; "))
            }
            Self::PolicyLoad { message } => write!(f, "policy load failed: {}", message),
            Self::TemplateResolution { step, reference } => {
                write!(f, "step '{}': unresolved template '{}'", step, reference)
            }
            Self::CapabilityNotFound { id } => write!(f, "capability not found: {}", id),
            Self::CapabilityFrozen { id, state } => {
                write!(f, "capability '{}' is {} and cannot execute", id, state)
            }
            Self::PolicyDenied { step, capability } => {
                write!(f, "policy denied step '{}' ({})", step, capability)
            }
            Self::ApprovalRejected { step, approver } => {
                write!(f, "step '{}' rejected by {}", step, approver)
            }
            Self::ApprovalTimeout { step } => write!(f, "approval timed out for step '{}'", step),
            Self::ApprovalConflict { step, message } => {
                write!(f, "approval conflict on step '{}': {}", step, message)
            }
            Self::StepExecution { step, message } => {
                write!(f, "step '{}' failed: {}", step, message)
            }
            Self::Compensation { step, message } => {
                write!(f, "compensation for step '{}' failed: {}", step, message)
            }
            Self::Persistence { message } => write!(f, "persistence failure: {}", message),
            Self::InvalidState { message } => write!(f, "invalid state: {}", message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence {
            message: format!("serialization: {}", e),
        }
    }
}
