//! Strongly typed primitives shared across the control plane.
//!
//! These newtypes and enums are used by every component: the registry, the
//! policy engine, the persistence layer, and the workflow engine itself.
//! All enums serialize in the exact casing used by workflow and policy
//! files, and expose `as_str()` for storage in the checkpoint database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a submitted workflow.
/// Assigned at submission; used as the primary key in the `workflows` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Creates a new random workflow ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a workflow ID from its string form.
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The principal a step runs under, matched by policy rules as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal type, e.g. `agent` or `user`.
    pub kind: String,
    /// Principal identifier within its type.
    pub id: String,
    /// Roles granted to the principal.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    /// Creates an agent principal, the common case for workflow steps.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: "agent".to_string(),
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// The `type:id` form policy rule globs match against.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// Risk classification of a capability or step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// High and critical risk escalate an ALLOW decision to approval.
    pub fn escalates(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// What class of side effect a capability performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Read,
    Write,
    Delete,
    Execute,
    Network,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Delete => "DELETE",
            Self::Execute => "EXECUTE",
            Self::Network => "NETWORK",
        }
    }
}

/// Where a capability's side effects land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EffectScope {
    #[default]
    Local,
    External,
    Remote,
}

/// How a capability's effects can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    Inverse,
    Restore,
    Delete,
    #[default]
    None,
}

/// Registry lifecycle of a capability. Frozen and deprecated capabilities
/// remain resolvable but are rejected at the workflow engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Active,
    Frozen,
    Deprecated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Frozen => "FROZEN",
            Self::Deprecated => "DEPRECATED",
        }
    }

    /// Whether the engine may execute steps against this capability.
    pub fn executable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// The kind of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    #[default]
    Action,
    HumanApproval,
    Parallel,
}

/// Workflow execution status, persisted verbatim in the `workflows` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
    Canceled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Canceled => "CANCELED",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Canceled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown workflow status: {}", other)),
        }
    }
}

/// Step execution status, persisted verbatim in the `workflow_steps` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Paused,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "PAUSED" => Ok(Self::Paused),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown step status: {}", other)),
        }
    }
}

/// The policy engine's verdict for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
            Self::RequireApproval => "REQUIRE_APPROVAL",
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a human approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(format!("unknown approval state: {}", other)),
        }
    }
}

/// The decision a human hands back through `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// How much detail the audit trail records for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    #[default]
    Basic,
    Detailed,
    Forensic,
}

/// What the engine does with an approval gate when webhook delivery fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookFailMode {
    Allow,
    Deny,
    #[default]
    Pause,
}

/// UTC timestamp alias used across persisted records.
pub type TimestampUtc = DateTime<Utc>;

/// Formats a timestamp the way the checkpoint database stores it:
/// ISO 8601 UTC with microsecond precision.
pub fn format_timestamp(ts: TimestampUtc) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_round_trips_through_str() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::RolledBack,
            WorkflowStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowStatus>(), Ok(status));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::RolledBack.is_terminal());
        assert!(WorkflowStatus::Canceled.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn risk_level_ordering_and_escalation() {
        assert!(RiskLevel::Low < RiskLevel::Critical);
        assert!(!RiskLevel::Medium.escalates());
        assert!(RiskLevel::High.escalates());
        assert!(RiskLevel::Critical.escalates());
    }

    #[test]
    fn principal_qualified_form() {
        let p = Principal::agent("deployer");
        assert_eq!(p.qualified(), "agent:deployer");
    }

    #[test]
    fn enum_serde_casing_matches_spec_files() {
        assert_eq!(
            serde_json::to_string(&StepKind::HumanApproval).unwrap(),
            "\"HUMAN_APPROVAL\""
        );
        assert_eq!(
            serde_json::to_string(&EffectScope::External).unwrap(),
            "\"external\""
        );
        assert_eq!(
            serde_json::to_string(&CompensationStrategy::Inverse).unwrap(),
            "\"inverse\""
        );
        assert_eq!(
            serde_json::to_string(&PolicyDecision::RequireApproval).unwrap(),
            "\"REQUIRE_APPROVAL\""
        );
    }
}
