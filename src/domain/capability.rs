//! Capability specifications and the risk consistency rules.
//!
//! A capability spec is the contract of one atomic executable unit. The
//! three risk consistency invariants make it impossible to register a
//! destructive capability with an understated risk label:
//!
//! 1. irreversible ⇒ risk is HIGH or CRITICAL
//! 2. DELETE operation ⇒ risk is HIGH or CRITICAL
//! 3. irreversible and uncompensatable ⇒ risk is CRITICAL

use super::errors::EngineError;
use super::types::{CompensationStrategy, EffectScope, OperationType, RiskLevel};
use serde::{Deserialize, Serialize};

/// A typed parameter accepted by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    /// Type tag, e.g. `string`, `integer`, `boolean`, `object`.
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// A typed output produced by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub description: String,
}

/// Declared side effects of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffects {
    pub reversible: bool,
    #[serde(default)]
    pub scope: EffectScope,
}

/// How a capability's effects are compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompensationSpec {
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub strategy: CompensationStrategy,
    /// A capability that undoes this one, invoked during rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_capability_id: Option<String>,
}

/// Risk classification and approval requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSpec {
    pub level: RiskLevel,
    #[serde(default)]
    pub justification: String,
    #[serde(default)]
    pub requires_approval: bool,
}

/// The v1 contract of one atomic executable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Dotted-namespace identifier, unique within the registry,
    /// e.g. `io.fs.write_file`.
    pub identifier: String,
    pub operation_type: OperationType,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    pub side_effects: SideEffects,
    #[serde(default)]
    pub compensation: CompensationSpec,
    pub risk: RiskSpec,
}

impl CapabilitySpec {
    /// Full schema validation plus the three risk consistency invariants.
    ///
    /// Collects every violation rather than stopping at the first, so a
    /// rejected registration reports the complete list.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut violations = Vec::new();

        if self.identifier.is_empty() {
            violations.push("identifier must not be empty".to_string());
        } else if !self
            .identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
            || self.identifier.starts_with('.')
            || self.identifier.ends_with('.')
        {
            violations.push(format!(
                "identifier '{}' must be a dotted namespace of alphanumeric segments",
                self.identifier
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() {
                violations.push("parameter names must not be empty".to_string());
            }
            if !seen.insert(param.name.as_str()) {
                violations.push(format!("duplicate parameter name '{}'", param.name));
            }
        }

        if self.compensation.supported
            && self.compensation.strategy == CompensationStrategy::None
            && self.compensation.compensating_capability_id.is_none()
        {
            violations.push(
                "compensation.supported requires a strategy or a compensating capability"
                    .to_string(),
            );
        }

        // Risk consistency invariant 1: irreversible effects demand elevated risk.
        if !self.side_effects.reversible && !self.risk.level.escalates() {
            violations.push(format!(
                "rule 1: irreversible capability must declare HIGH or CRITICAL risk, got {}",
                self.risk.level
            ));
        }

        // Risk consistency invariant 2: DELETE operations demand elevated risk.
        if self.operation_type == OperationType::Delete && !self.risk.level.escalates() {
            violations.push(format!(
                "rule 2: DELETE capability must declare HIGH or CRITICAL risk, got {}",
                self.risk.level
            ));
        }

        // Risk consistency invariant 3: irreversible and uncompensatable is CRITICAL only.
        if !self.side_effects.reversible
            && !self.compensation.supported
            && self.risk.level != RiskLevel::Critical
        {
            violations.push(format!(
                "rule 3: irreversible capability without compensation must be CRITICAL, got {}",
                self.risk.level
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::SpecValidation { violations })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reversible_write(level: RiskLevel) -> CapabilitySpec {
        CapabilitySpec {
            identifier: "io.fs.write_file".to_string(),
            operation_type: OperationType::Write,
            parameters: vec![ParameterDef {
                name: "path".to_string(),
                type_tag: "string".to_string(),
                required: true,
                description: String::new(),
            }],
            outputs: vec![],
            side_effects: SideEffects {
                reversible: true,
                scope: EffectScope::Local,
            },
            compensation: CompensationSpec {
                supported: true,
                strategy: CompensationStrategy::Delete,
                compensating_capability_id: Some("io.fs.delete_file".to_string()),
            },
            risk: RiskSpec {
                level,
                justification: "writes a local file".to_string(),
                requires_approval: false,
            },
        }
    }

    #[test]
    fn reversible_low_risk_write_is_valid() {
        assert!(reversible_write(RiskLevel::Low).validate().is_ok());
    }

    #[test]
    fn irreversible_low_risk_violates_rule_one() {
        let mut spec = reversible_write(RiskLevel::Low);
        spec.side_effects.reversible = false;
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("rule 1"));
    }

    #[test]
    fn low_risk_delete_violates_rule_two() {
        let mut spec = reversible_write(RiskLevel::Low);
        spec.operation_type = OperationType::Delete;
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("rule 2"));
    }

    #[test]
    fn irreversible_uncompensatable_must_be_critical() {
        let mut spec = reversible_write(RiskLevel::High);
        spec.side_effects.reversible = false;
        spec.compensation = CompensationSpec::default();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("rule 3"));

        spec.risk.level = RiskLevel::Critical;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn all_violations_are_reported_together() {
        let mut spec = reversible_write(RiskLevel::Low);
        spec.operation_type = OperationType::Delete;
        spec.side_effects.reversible = false;
        spec.compensation = CompensationSpec::default();
        match spec.validate() {
            Err(EngineError::SpecValidation { violations }) => {
                assert_eq!(violations.len(), 3);
            }
            other => panic!("expected SpecValidation, got {:?}", other),
        }
    }

    #[test]
    fn malformed_identifier_is_rejected() {
        let mut spec = reversible_write(RiskLevel::Low);
        spec.identifier = ".io.fs".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_round_trips_through_yaml() {
        let spec = reversible_write(RiskLevel::Medium);
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: CapabilitySpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, back);
    }
}
