//! Unit tests for the approval manager.

use super::*;
use crate::domain::{StepSpec, WorkflowSpec};
use serde_json::json;

fn seeded() -> (ApprovalManager, Arc<Store>, WorkflowId) {
    let store = Arc::new(Store::in_memory().unwrap());
    let spec = WorkflowSpec {
        name: "gated".to_string(),
        version: "0.1.0".to_string(),
        owner: "tester".to_string(),
        description: String::new(),
        metadata: Default::default(),
        auto_rollback: true,
        steps: vec![StepSpec {
            name: "gate".to_string(),
            kind: crate::domain::StepKind::HumanApproval,
            capability: None,
            agent_name: None,
            inputs: serde_json::Map::new(),
            depends_on: vec![],
            compensation: None,
            max_retries: 2,
            risk_level: None,
            timeout_ms: None,
            steps: vec![],
        }],
    };
    let id = WorkflowId::new();
    let yaml = spec.to_yaml().unwrap();
    store.create_workflow(id, &spec, &yaml).unwrap();
    let manager = ApprovalManager::new(Arc::clone(&store), None);
    (manager, store, id)
}

#[tokio::test]
async fn request_without_webhook_is_skipped_but_persisted() {
    let (manager, _store, id) = seeded();
    let delivery = manager
        .request_approval(id, "gated", "gate", "ok to proceed?", json!({"k": "v"}))
        .await
        .unwrap();
    assert_eq!(delivery, WebhookDelivery::Skipped);

    let pending = manager.get_pending(id, None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].step_name, "gate");
    assert_eq!(pending[0].message, "ok to proceed?");
}

#[tokio::test]
async fn decision_clears_pending_and_is_idempotent() {
    let (manager, _store, id) = seeded();
    manager
        .request_approval(id, "gated", "gate", "ok?", serde_json::Value::Null)
        .await
        .unwrap();

    manager
        .record_decision(id, "gate", ApprovalDecision::Approved, "alice", Some("fine"))
        .unwrap();
    manager
        .record_decision(id, "gate", ApprovalDecision::Approved, "alice", None)
        .unwrap();

    let err = manager
        .record_decision(id, "gate", ApprovalDecision::Rejected, "bob", None)
        .unwrap_err();
    assert!(matches!(err, EngineError::ApprovalConflict { .. }));

    assert!(manager.get_pending(id, None).unwrap().is_empty());
    let record = manager.get(id, "gate").unwrap().unwrap();
    assert_eq!(record.state, ApprovalState::Approved);
}

#[tokio::test]
async fn timeout_transitions_pending_record() {
    let (manager, _store, id) = seeded();
    manager
        .request_approval(id, "gated", "gate", "ok?", serde_json::Value::Null)
        .await
        .unwrap();

    manager.record_timeout(id, "gate").unwrap();
    let record = manager.get(id, "gate").unwrap().unwrap();
    assert_eq!(record.state, ApprovalState::Timeout);
    assert!(manager.get_pending(id, Some("gate")).unwrap().is_empty());
}
