//! Validated catalog of capabilities and their handlers.
//!
//! The registry is a passive lookup: it validates specs at registration
//! (schema plus the risk consistency invariants), binds each spec to an
//! executable handler, and answers `get`/`resolve_handler` queries. It
//! contains no policy or execution logic. Specs are immutable once
//! registered; lifecycle state is the only mutable attribute, and frozen
//! or deprecated capabilities are rejected at the engine boundary.

use crate::domain::{
    CapabilitySpec, CompensationIntent, EngineError, LifecycleState, Principal, UndoFn, WorkflowId,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Read-only context handed to a handler for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub principal: Principal,
}

/// What a handler returns: outputs plus, for side-effecting capabilities,
/// how to undo the effect.
///
/// The intent form is persisted and survives a crash; the closure form is
/// an in-memory fast path only. Side-effecting handlers should always emit
/// an intent so recovery stays deterministic.
pub struct HandlerOutcome {
    pub outputs: Map<String, Value>,
    pub compensation: Option<CompensationIntent>,
    pub undo: Option<UndoFn>,
}

impl HandlerOutcome {
    pub fn new(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            compensation: None,
            undo: None,
        }
    }

    /// No outputs, no side effects.
    pub fn empty() -> Self {
        Self::new(Map::new())
    }

    pub fn with_compensation(mut self, intent: CompensationIntent) -> Self {
        self.compensation = Some(intent);
        self
    }

    pub fn with_undo(mut self, undo: UndoFn) -> Self {
        self.undo = Some(undo);
        self
    }
}

impl std::fmt::Debug for HandlerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOutcome")
            .field("outputs", &self.outputs)
            .field("compensation", &self.compensation)
            .field("undo", &self.undo.as_ref().map(|_| "<closure>"))
            .finish()
    }
}

/// The executable side of a capability, bound at registration.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: &InvocationContext,
    ) -> anyhow::Result<HandlerOutcome>;
}

struct Registered {
    spec: Arc<CapabilitySpec>,
    handler: Arc<dyn CapabilityHandler>,
    lifecycle: LifecycleState,
}

/// Thread-safe capability catalog.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Registered>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a capability. Fails with `SpecValidation`
    /// listing every violated rule, or on a duplicate id; either way no
    /// partial registration is observable.
    pub fn register(
        &self,
        spec: CapabilitySpec,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), EngineError> {
        spec.validate()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&spec.identifier) {
            return Err(EngineError::SpecValidation {
                violations: vec![format!("capability '{}' already registered", spec.identifier)],
            });
        }
        entries.insert(
            spec.identifier.clone(),
            Registered {
                spec: Arc::new(spec),
                handler,
                lifecycle: LifecycleState::Active,
            },
        );
        Ok(())
    }

    /// Returns the stored spec.
    pub fn get(&self, capability_id: &str) -> Result<Arc<CapabilitySpec>, EngineError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(capability_id)
            .map(|r| Arc::clone(&r.spec))
            .ok_or_else(|| EngineError::CapabilityNotFound {
                id: capability_id.to_string(),
            })
    }

    /// Returns the handler bound at registration.
    pub fn resolve_handler(
        &self,
        capability_id: &str,
    ) -> Result<Arc<dyn CapabilityHandler>, EngineError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(capability_id)
            .map(|r| Arc::clone(&r.handler))
            .ok_or_else(|| EngineError::CapabilityNotFound {
                id: capability_id.to_string(),
            })
    }

    /// Current lifecycle state of a capability.
    pub fn lifecycle(&self, capability_id: &str) -> Result<LifecycleState, EngineError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(capability_id)
            .map(|r| r.lifecycle)
            .ok_or_else(|| EngineError::CapabilityNotFound {
                id: capability_id.to_string(),
            })
    }

    /// The only mutation allowed after registration. Capabilities are never
    /// unregistered; they are frozen or deprecated instead.
    pub fn set_lifecycle(
        &self,
        capability_id: &str,
        state: LifecycleState,
    ) -> Result<(), EngineError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(capability_id) {
            Some(entry) => {
                entry.lifecycle = state;
                Ok(())
            }
            None => Err(EngineError::CapabilityNotFound {
                id: capability_id.to_string(),
            }),
        }
    }

    /// Registered capability ids, for discovery surfaces.
    pub fn identifiers(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
