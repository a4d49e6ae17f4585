//! warden: a transactional workflow control plane for governed agent
//! execution.
//!
//! Callers submit declarative workflow specifications (sequences of
//! capability invocations). The engine executes them with at-most-once
//! semantics per step, enforces declarative access policies before each
//! step, checkpoints progress durably so a crash never loses work, pauses
//! at human-approval gates, and on any failure or rejection rolls back
//! completed steps in reverse order via their compensating actions (the
//! Saga pattern).
//!
//! The crate is composed of five subsystems, assembled by injection:
//!
//! - [`registry::CapabilityRegistry`]: a validated, immutable-once-registered
//!   catalog of capabilities with risk consistency invariants.
//! - [`persistence::Store`]: the durable SQLite checkpoint store and the
//!   source of truth for recovery.
//! - [`policy::PolicyEngine`]: a pure, declarative first-match-wins rule
//!   evaluator with fail-closed defaults and risk escalation.
//! - [`approval::ApprovalManager`]: pause/resume bookkeeping with
//!   best-effort webhook notification.
//! - [`engine::WorkflowEngine`]: the state machine that sequences steps,
//!   captures compensations, and orchestrates rollback. The only mutator
//!   of workflow state.

pub mod approval;
pub mod audit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod paths;
pub mod persistence;
pub mod policy;
pub mod registry;

pub use approval::{ApprovalManager, WebhookClient};
pub use audit::AuditLog;
pub use config::EngineConfig;
pub use domain::{
    ApprovalDecision, CapabilitySpec, EngineError, PolicyDecision, RiskLevel, StepKind,
    WorkflowId, WorkflowSpec, WorkflowStatus,
};
pub use engine::{WorkflowEngine, WorkflowSnapshot};
pub use persistence::Store;
pub use policy::{PolicyEngine, PolicySet};
pub use registry::{CapabilityHandler, CapabilityRegistry, HandlerOutcome, InvocationContext};
