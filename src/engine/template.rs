//! `{{step_name.output_key}}` template resolution.
//!
//! A small, purely syntactic transformation applied to step inputs before
//! handler invocation. A string that is exactly one reference takes the
//! referenced value with its type preserved; references embedded in a
//! larger string are substituted textually. Unresolved references fail
//! fast. No arithmetic, no conditionals.

use crate::domain::EngineError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+)\s*\}\}")
            .expect("template reference pattern is valid")
    })
}

fn full_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*([A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+)\s*\}\}$")
            .expect("full template reference pattern is valid")
    })
}

/// Resolves every template reference in `inputs` against the accumulated
/// step outputs. Fails with `TemplateResolution` on the first reference
/// that has no value.
pub fn resolve_inputs(
    step_name: &str,
    inputs: &Map<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut resolved = Map::new();
    for (key, value) in inputs {
        resolved.insert(key.clone(), resolve_value(step_name, value, outputs)?);
    }
    Ok(resolved)
}

fn resolve_value(
    step_name: &str,
    value: &Value,
    outputs: &HashMap<String, Value>,
) -> Result<Value, EngineError> {
    match value {
        Value::String(text) => resolve_string(step_name, text, outputs),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(step_name, v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|v| resolve_value(step_name, v, outputs))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    step_name: &str,
    text: &str,
    outputs: &HashMap<String, Value>,
) -> Result<Value, EngineError> {
    // A lone reference keeps the referenced value's type.
    if let Some(caps) = full_reference_re().captures(text) {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        return outputs
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::TemplateResolution {
                step: step_name.to_string(),
                reference: key.to_string(),
            });
    }

    let mut missing: Option<String> = None;
    let substituted = reference_re().replace_all(text, |caps: &regex::Captures<'_>| {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match outputs.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                if missing.is_none() {
                    missing = Some(key.to_string());
                }
                String::new()
            }
        }
    });

    if let Some(reference) = missing {
        return Err(EngineError::TemplateResolution {
            step: step_name.to_string(),
            reference,
        });
    }
    Ok(Value::String(substituted.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("write.path".to_string(), json!("/tmp/a"));
        map.insert("count.total".to_string(), json!(42));
        map.insert("probe.ok".to_string(), json!(true));
        map
    }

    #[test]
    fn lone_reference_preserves_type() {
        let mut inputs = Map::new();
        inputs.insert("target".to_string(), json!("{{write.path}}"));
        inputs.insert("limit".to_string(), json!("{{count.total}}"));
        inputs.insert("enabled".to_string(), json!("{{ probe.ok }}"));

        let resolved = resolve_inputs("step", &inputs, &outputs()).unwrap();
        assert_eq!(resolved.get("target"), Some(&json!("/tmp/a")));
        assert_eq!(resolved.get("limit"), Some(&json!(42)));
        assert_eq!(resolved.get("enabled"), Some(&json!(true)));
    }

    #[test]
    fn embedded_references_substitute_textually() {
        let mut inputs = Map::new();
        inputs.insert(
            "summary".to_string(),
            json!("wrote {{write.path}} ({{count.total}} bytes)"),
        );
        let resolved = resolve_inputs("step", &inputs, &outputs()).unwrap();
        assert_eq!(
            resolved.get("summary"),
            Some(&json!("wrote /tmp/a (42 bytes)"))
        );
    }

    #[test]
    fn nested_structures_are_resolved() {
        let mut inputs = Map::new();
        inputs.insert(
            "request".to_string(),
            json!({"paths": ["{{write.path}}"], "meta": {"n": "{{count.total}}"}}),
        );
        let resolved = resolve_inputs("step", &inputs, &outputs()).unwrap();
        assert_eq!(
            resolved.get("request"),
            Some(&json!({"paths": ["/tmp/a"], "meta": {"n": 42}}))
        );
    }

    #[test]
    fn unresolved_reference_fails_fast() {
        let mut inputs = Map::new();
        inputs.insert("target".to_string(), json!("{{ghost.path}}"));
        let err = resolve_inputs("step", &inputs, &outputs()).unwrap_err();
        match err {
            EngineError::TemplateResolution { step, reference } => {
                assert_eq!(step, "step");
                assert_eq!(reference, "ghost.path");
            }
            other => panic!("expected TemplateResolution, got {:?}", other),
        }
    }

    #[test]
    fn literals_pass_through_untouched() {
        let mut inputs = Map::new();
        inputs.insert("n".to_string(), json!(7));
        inputs.insert("plain".to_string(), json!("no templates here"));
        let resolved = resolve_inputs("step", &inputs, &HashMap::new()).unwrap();
        assert_eq!(resolved.get("n"), Some(&json!(7)));
        assert_eq!(resolved.get("plain"), Some(&json!("no templates here")));
    }
}
