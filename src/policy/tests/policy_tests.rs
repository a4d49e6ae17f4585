//! Unit and property tests for policy evaluation.

use super::*;
use proptest::prelude::*;

const RULES_YAML: &str = r#"
default: DENY
rules:
  - when: { capability: "io.fs.delete_file" }
    principal: "agent:*"
    decision: DENY
  - when: { capability: "io.fs.*" }
    principal: "agent:*"
    decision: ALLOW
  - when: { capability: "net.*", risk_level: MEDIUM }
    principal: "agent:crawler"
    decision: REQUIRE_APPROVAL
"#;

fn ctx(capability: &str, risk: RiskLevel) -> PolicyContext {
    PolicyContext {
        principal: Principal::agent("worker"),
        capability_id: capability.to_string(),
        risk_level: risk,
        workflow_id: WorkflowId::new(),
        step_name: "step".to_string(),
        inputs: Value::Null,
    }
}

#[test]
fn first_match_wins_in_declaration_order() {
    let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
    // The DENY on delete_file is declared before the io.fs.* ALLOW.
    assert_eq!(
        engine.evaluate(&ctx("io.fs.delete_file", RiskLevel::Low)),
        PolicyDecision::Deny
    );
    assert_eq!(
        engine.evaluate(&ctx("io.fs.write_file", RiskLevel::Low)),
        PolicyDecision::Allow
    );
}

#[test]
fn unmatched_context_falls_through_to_default() {
    let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
    assert_eq!(
        engine.evaluate(&ctx("db.sql.query", RiskLevel::Low)),
        PolicyDecision::Deny
    );
}

#[test]
fn missing_default_fails_closed() {
    let engine = PolicyEngine::from_yaml("rules: []").unwrap();
    assert_eq!(
        engine.evaluate(&ctx("anything.at.all", RiskLevel::Low)),
        PolicyDecision::Deny
    );
}

#[test]
fn fallback_default_is_returned_unescalated() {
    // Escalation is scoped to matched rules; an ALLOW default applies as
    // declared even for elevated-risk contexts.
    let engine = PolicyEngine::from_yaml("default: ALLOW\nrules: []").unwrap();
    assert_eq!(
        engine.evaluate(&ctx("db.sql.drop", RiskLevel::Critical)),
        PolicyDecision::Allow
    );
    assert_eq!(
        engine.evaluate(&ctx("db.sql.drop", RiskLevel::Low)),
        PolicyDecision::Allow
    );
}

#[test]
fn allow_escalates_on_high_and_critical_risk() {
    let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
    assert_eq!(
        engine.evaluate(&ctx("io.fs.write_file", RiskLevel::High)),
        PolicyDecision::RequireApproval
    );
    assert_eq!(
        engine.evaluate(&ctx("io.fs.write_file", RiskLevel::Critical)),
        PolicyDecision::RequireApproval
    );
    // DENY is never escalated.
    assert_eq!(
        engine.evaluate(&ctx("io.fs.delete_file", RiskLevel::Critical)),
        PolicyDecision::Deny
    );
}

#[test]
fn risk_condition_requires_equality() {
    let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
    let mut context = ctx("net.http.get", RiskLevel::Medium);
    context.principal = Principal::agent("crawler");
    assert_eq!(engine.evaluate(&context), PolicyDecision::RequireApproval);

    context.risk_level = RiskLevel::Low;
    // Risk mismatch: the net.* rule does not match and the default applies.
    assert_eq!(engine.evaluate(&context), PolicyDecision::Deny);
}

#[test]
fn principal_glob_is_matched_against_type_and_id() {
    let engine = PolicyEngine::from_yaml(
        r#"
default: DENY
rules:
  - when: { capability: "*" }
    principal: "user:admin"
    decision: ALLOW
"#,
    )
    .unwrap();

    let mut context = ctx("io.fs.read", RiskLevel::Low);
    assert_eq!(engine.evaluate(&context), PolicyDecision::Deny);

    context.principal = Principal {
        kind: "user".to_string(),
        id: "admin".to_string(),
        roles: vec![],
    };
    assert_eq!(engine.evaluate(&context), PolicyDecision::Allow);
}

#[test]
fn malformed_rule_set_fails_at_load_time() {
    assert!(matches!(
        PolicyEngine::from_yaml("default: MAYBE"),
        Err(EngineError::PolicyLoad { .. })
    ));
    assert!(matches!(
        PolicyEngine::from_yaml("rules:\n  - when: { capability: \"\" }\n    principal: \"x\"\n    decision: ALLOW"),
        Err(EngineError::PolicyLoad { .. })
    ));
}

#[test]
fn glob_matcher_cases() {
    assert!(glob_match("io.fs.*", "io.fs.write_file"));
    assert!(glob_match("*", "anything"));
    assert!(glob_match("*", ""));
    assert!(glob_match("agent:*", "agent:worker"));
    assert!(glob_match("io.*.write", "io.fs.write"));
    assert!(glob_match("io.fs.write", "io.fs.write"));
    assert!(!glob_match("io.fs.*", "net.http.get"));
    assert!(!glob_match("agent:*", "user:admin"));
    assert!(!glob_match("io.fs", "io.fs.write"));
    assert!(!glob_match("", "x"));
    assert!(glob_match("", ""));
}

proptest! {
    /// Purity: identical (rules, context) always yields the identical
    /// decision, and evaluation leaves the context untouched.
    #[test]
    fn evaluation_is_deterministic(
        capability in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}",
        principal_id in "[a-z]{1,8}",
    ) {
        let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
        let context = PolicyContext {
            principal: Principal::agent(principal_id),
            capability_id: capability,
            risk_level: RiskLevel::Medium,
            workflow_id: WorkflowId::new(),
            step_name: "s".to_string(),
            inputs: Value::Null,
        };
        let before = context.clone();
        let first = engine.evaluate(&context);
        let second = engine.evaluate(&context);
        prop_assert_eq!(first, second);
        prop_assert_eq!(context.capability_id, before.capability_id);
        prop_assert_eq!(context.principal, before.principal);
    }

    /// A matching ALLOW under elevated risk always comes back as
    /// REQUIRE_APPROVAL.
    #[test]
    fn allow_never_survives_elevated_risk(suffix in "[a-z]{1,10}") {
        let engine = PolicyEngine::from_yaml(RULES_YAML).unwrap();
        let context = ctx(&format!("io.fs.{}", suffix), RiskLevel::Critical);
        let decision = engine.evaluate(&context);
        prop_assert_ne!(decision, PolicyDecision::Allow);
    }
}
