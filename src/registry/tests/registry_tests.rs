//! Unit and property tests for capability registration.

use super::*;
use crate::domain::capability::{CompensationSpec, RiskSpec, SideEffects};
use crate::domain::{CompensationStrategy, EffectScope, OperationType, RiskLevel};
use async_trait::async_trait;
use proptest::prelude::*;

struct NoopHandler;

#[async_trait]
impl CapabilityHandler for NoopHandler {
    async fn execute(
        &self,
        _inputs: &Map<String, Value>,
        _ctx: &InvocationContext,
    ) -> anyhow::Result<HandlerOutcome> {
        Ok(HandlerOutcome::empty())
    }
}

fn spec(
    id: &str,
    op: OperationType,
    reversible: bool,
    compensable: bool,
    level: RiskLevel,
) -> CapabilitySpec {
    CapabilitySpec {
        identifier: id.to_string(),
        operation_type: op,
        parameters: vec![],
        outputs: vec![],
        side_effects: SideEffects {
            reversible,
            scope: EffectScope::Local,
        },
        compensation: CompensationSpec {
            supported: compensable,
            strategy: if compensable {
                CompensationStrategy::Inverse
            } else {
                CompensationStrategy::None
            },
            compensating_capability_id: None,
        },
        risk: RiskSpec {
            level,
            justification: "test".to_string(),
            requires_approval: false,
        },
    }
}

#[test]
fn register_then_get_and_resolve() {
    let registry = CapabilityRegistry::new();
    registry
        .register(
            spec("io.fs.read", OperationType::Read, true, false, RiskLevel::Low),
            Arc::new(NoopHandler),
        )
        .unwrap();

    assert_eq!(registry.get("io.fs.read").unwrap().identifier, "io.fs.read");
    assert!(registry.resolve_handler("io.fs.read").is_ok());
    assert_eq!(registry.identifiers(), vec!["io.fs.read".to_string()]);
}

#[test]
fn duplicate_registration_is_rejected() {
    let registry = CapabilityRegistry::new();
    let s = spec("io.fs.read", OperationType::Read, true, false, RiskLevel::Low);
    registry.register(s.clone(), Arc::new(NoopHandler)).unwrap();
    let err = registry.register(s, Arc::new(NoopHandler)).unwrap_err();
    assert!(err.to_string().contains("already registered"));
}

#[test]
fn missing_capability_is_not_found() {
    let registry = CapabilityRegistry::new();
    assert!(matches!(
        registry.get("ghost.capability"),
        Err(EngineError::CapabilityNotFound { .. })
    ));
    assert!(matches!(
        registry.resolve_handler("ghost.capability"),
        Err(EngineError::CapabilityNotFound { .. })
    ));
}

#[test]
fn rejected_spec_leaves_registry_unchanged() {
    let registry = CapabilityRegistry::new();
    let bad = spec(
        "io.fs.delete",
        OperationType::Delete,
        true,
        true,
        RiskLevel::Low,
    );
    let err = registry.register(bad, Arc::new(NoopHandler)).unwrap_err();
    assert!(err.to_string().contains("rule 2"));
    assert!(registry.get("io.fs.delete").is_err());
    assert!(registry.identifiers().is_empty());
}

#[test]
fn lifecycle_transitions_stick() {
    let registry = CapabilityRegistry::new();
    registry
        .register(
            spec("net.http.get", OperationType::Network, true, false, RiskLevel::Low),
            Arc::new(NoopHandler),
        )
        .unwrap();

    assert!(registry.lifecycle("net.http.get").unwrap().executable());
    registry
        .set_lifecycle("net.http.get", LifecycleState::Frozen)
        .unwrap();
    assert_eq!(
        registry.lifecycle("net.http.get").unwrap(),
        LifecycleState::Frozen
    );
    assert!(!registry.lifecycle("net.http.get").unwrap().executable());
    // Spec and handler remain resolvable while frozen.
    assert!(registry.get("net.http.get").is_ok());
}

fn arb_operation() -> impl Strategy<Value = OperationType> {
    prop_oneof![
        Just(OperationType::Read),
        Just(OperationType::Write),
        Just(OperationType::Delete),
        Just(OperationType::Execute),
        Just(OperationType::Network),
    ]
}

fn arb_risk() -> impl Strategy<Value = RiskLevel> {
    prop_oneof![
        Just(RiskLevel::Low),
        Just(RiskLevel::Medium),
        Just(RiskLevel::High),
        Just(RiskLevel::Critical),
    ]
}

proptest! {
    /// Every spec the registry accepts satisfies all three risk
    /// consistency invariants.
    #[test]
    fn accepted_specs_satisfy_risk_consistency(
        op in arb_operation(),
        reversible in any::<bool>(),
        compensable in any::<bool>(),
        level in arb_risk(),
    ) {
        let registry = CapabilityRegistry::new();
        let s = spec("cap.under.test", op, reversible, compensable, level);
        if registry.register(s, Arc::new(NoopHandler)).is_ok() {
            prop_assert!(reversible || level.escalates());
            prop_assert!(op != OperationType::Delete || level.escalates());
            prop_assert!(reversible || compensable || level == RiskLevel::Critical);
        }
    }
}
