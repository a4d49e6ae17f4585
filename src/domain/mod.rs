//! Shared data model for the workflow control plane.
//!
//! Leaves of the dependency tree: identifiers, enums, error types, and the
//! capability and workflow specifications. Nothing in here talks to the
//! database, the network, or the policy engine.

pub mod capability;
pub mod errors;
pub mod types;
pub mod workflow;

pub use capability::{
    CapabilitySpec, CompensationSpec, OutputDef, ParameterDef, RiskSpec, SideEffects,
};
pub use errors::EngineError;
pub use types::{
    format_timestamp, ApprovalDecision, ApprovalState, AuditLevel, CompensationStrategy,
    EffectScope, LifecycleState, OperationType, PolicyDecision, Principal, RiskLevel, StepKind,
    StepStatus, TimestampUtc, WebhookFailMode, WorkflowId, WorkflowStatus,
};
pub use workflow::{
    CompensationEntry, CompensationIntent, ExecutionState, StepCompensation, StepSpec, UndoFn,
    WorkflowMetadata, WorkflowSpec,
};
