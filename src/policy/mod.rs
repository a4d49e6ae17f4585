//! Declarative policy evaluation: gatekeeper, not commander.
//!
//! Rules are loaded once from a YAML document and evaluated first-match-wins
//! in declaration order. The evaluator is a pure function of
//! (rules, context): it never touches the database, never mutates its
//! inputs, and never fails at evaluation time. The pattern language is a
//! single `*` wildcard: no regex, no negation, no boolean logic.

use crate::domain::{EngineError, PolicyDecision, Principal, RiskLevel, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Condition atoms of one rule's `when` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Exact or wildcard capability match, e.g. `io.fs.*`.
    pub capability: String,
    /// Optional equality on the step's risk level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

/// One declarative rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub when: RuleCondition,
    /// Glob over `type:id`, e.g. `agent:*`.
    pub principal: String,
    pub decision: PolicyDecision,
}

fn default_decision() -> PolicyDecision {
    // Fail closed when the document omits a default.
    PolicyDecision::Deny
}

/// A complete rule set: ordered rules plus the fallback decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default = "default_decision")]
    pub default: PolicyDecision,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            default: PolicyDecision::Deny,
            rules: Vec::new(),
        }
    }
}

/// Immutable evaluation context for one step.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub principal: Principal,
    pub capability_id: String,
    pub risk_level: RiskLevel,
    pub workflow_id: WorkflowId,
    pub step_name: String,
    /// Resolved step inputs, read-only.
    pub inputs: Value,
}

/// The rule evaluator. Read-only after construction; re-entrant.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    set: PolicySet,
}

impl PolicyEngine {
    pub fn new(set: PolicySet) -> Self {
        Self { set }
    }

    /// An engine with no rules: every decision is the fail-closed default.
    pub fn deny_all() -> Self {
        Self::new(PolicySet::default())
    }

    /// Parses and validates a rule set from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let set: PolicySet = serde_yaml::from_str(yaml).map_err(|e| EngineError::PolicyLoad {
            message: e.to_string(),
        })?;
        for (idx, rule) in set.rules.iter().enumerate() {
            if rule.when.capability.is_empty() {
                return Err(EngineError::PolicyLoad {
                    message: format!("rule {}: empty capability pattern", idx),
                });
            }
            if rule.principal.is_empty() {
                return Err(EngineError::PolicyLoad {
                    message: format!("rule {}: empty principal pattern", idx),
                });
            }
        }
        Ok(Self::new(set))
    }

    /// Loads a rule set from a file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::PolicyLoad {
            message: format!("read {}: {}", path.display(), e),
        })?;
        Self::from_yaml(&content)
    }

    /// First-match-wins evaluation with risk escalation.
    ///
    /// A matching ALLOW on a HIGH or CRITICAL risk context is promoted to
    /// REQUIRE_APPROVAL. Escalation applies only to a matched rule's
    /// decision; when no rule matches, the configured default is returned
    /// as declared.
    pub fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        let qualified = ctx.principal.qualified();
        for rule in &self.set.rules {
            if !glob_match(&rule.principal, &qualified) {
                continue;
            }
            if !glob_match(&rule.when.capability, &ctx.capability_id) {
                continue;
            }
            if let Some(risk) = rule.when.risk_level {
                if risk != ctx.risk_level {
                    continue;
                }
            }
            return escalate(rule.decision, ctx.risk_level);
        }
        self.set.default
    }
}

fn escalate(decision: PolicyDecision, risk: RiskLevel) -> PolicyDecision {
    if decision == PolicyDecision::Allow && risk.escalates() {
        PolicyDecision::RequireApproval
    } else {
        decision
    }
}

/// Matches `text` against `pattern`, where `*` matches any (possibly
/// empty) sequence of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let mut pi = 0;
    let mut ti = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
#[path = "tests/policy_tests.rs"]
mod tests;
