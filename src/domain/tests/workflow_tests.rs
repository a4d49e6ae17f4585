//! Unit tests for workflow spec parsing, validation, and execution state.

use super::*;
use crate::domain::types::StepKind;
use serde_json::json;

const SAMPLE_YAML: &str = r#"
name: provision-sandbox
version: 1.0.0
owner: platform
description: provision a scratch workspace
metadata:
  tags: [sandbox]
  audit_level: DETAILED
steps:
  - name: write_marker
    kind: ACTION
    capability: io.fs.write_file
    agent: provisioner
    inputs:
      path: /tmp/marker
      content: ready
  - name: confirm
    kind: HUMAN_APPROVAL
    depends_on: [write_marker]
    inputs:
      message: "proceed?"
  - name: announce
    kind: ACTION
    capability: net.http.post
    depends_on: [confirm]
    inputs:
      url: https://example.test/hook
      body: "{{write_marker.path}}"
    max_retries: 1
"#;

#[test]
fn sample_yaml_parses_and_validates() {
    let spec = WorkflowSpec::from_yaml(SAMPLE_YAML).unwrap();
    assert_eq!(spec.name, "provision-sandbox");
    assert_eq!(spec.steps.len(), 3);
    assert_eq!(spec.steps[0].kind, StepKind::Action);
    assert_eq!(spec.steps[0].agent_name.as_deref(), Some("provisioner"));
    assert_eq!(spec.steps[1].kind, StepKind::HumanApproval);
    assert_eq!(spec.steps[2].max_retries, 1);
    // Unspecified max_retries defaults to two retries, three attempts.
    assert_eq!(spec.steps[0].max_retries, 2);
    assert!(spec.auto_rollback);
}

#[test]
fn yaml_round_trip_is_structurally_equal() {
    let spec = WorkflowSpec::from_yaml(SAMPLE_YAML).unwrap();
    let yaml = spec.to_yaml().unwrap();
    let back = WorkflowSpec::from_yaml(&yaml).unwrap();
    assert_eq!(spec, back);
}

#[test]
fn duplicate_step_names_are_rejected() {
    let yaml = r#"
name: dup
version: 0.1.0
steps:
  - name: a
    capability: x.y
  - name: a
    capability: x.z
"#;
    let err = WorkflowSpec::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("duplicate step name"));
}

#[test]
fn unknown_dependency_is_rejected() {
    let yaml = r#"
name: dangling
version: 0.1.0
steps:
  - name: a
    capability: x.y
    depends_on: [ghost]
"#;
    let err = WorkflowSpec::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("unknown step 'ghost'"));
}

#[test]
fn forward_dependency_is_a_cycle() {
    let yaml = r#"
name: cyclic
version: 0.1.0
steps:
  - name: a
    capability: x.y
    depends_on: [b]
  - name: b
    capability: x.z
"#;
    let err = WorkflowSpec::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn action_without_capability_is_rejected() {
    let yaml = r#"
name: missing-cap
version: 0.1.0
steps:
  - name: a
    kind: ACTION
"#;
    let err = WorkflowSpec::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("must name a capability"));
}

#[test]
fn parallel_group_requires_action_sub_steps() {
    let yaml = r#"
name: fanout
version: 0.1.0
steps:
  - name: group
    kind: PARALLEL
    steps:
      - name: branch_a
        capability: x.y
      - name: branch_b
        capability: x.z
"#;
    let spec = WorkflowSpec::from_yaml(yaml).unwrap();
    assert_eq!(spec.steps[0].steps.len(), 2);

    let empty = r#"
name: fanout
version: 0.1.0
steps:
  - name: group
    kind: PARALLEL
"#;
    assert!(WorkflowSpec::from_yaml(empty).is_err());
}

#[test]
fn approval_gate_inside_parallel_group_is_rejected() {
    let yaml = r#"
name: fanout
version: 0.1.0
steps:
  - name: group
    kind: PARALLEL
    steps:
      - name: gate
        kind: HUMAN_APPROVAL
"#;
    let err = WorkflowSpec::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("cannot appear inside a PARALLEL"));
}

#[test]
fn outputs_are_immutable_once_written() {
    let mut state = ExecutionState::new();
    let mut outputs = serde_json::Map::new();
    outputs.insert("path".to_string(), json!("/tmp/a"));
    state.merge_outputs("step1", &outputs);

    let mut overwrite = serde_json::Map::new();
    overwrite.insert("path".to_string(), json!("/tmp/b"));
    state.merge_outputs("step1", &overwrite);

    assert_eq!(state.step_outputs.get("step1.path"), Some(&json!("/tmp/a")));
}

#[test]
fn completed_steps_record_once_in_order() {
    let mut state = ExecutionState::new();
    state.record_completed("a");
    state.record_completed("b");
    state.record_completed("a");
    assert_eq!(state.completed_steps, vec!["a", "b"]);
    assert!(state.is_completed("a"));
    assert!(!state.is_completed("c"));
}
