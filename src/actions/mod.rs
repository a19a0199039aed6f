//! Action executor boundary.
//!
//! The engine never touches the document application directly. Every
//! action goes through an [`ActionExecutor`]: `invoke` performs a mutation
//! (or query) and `lookup` answers read-only existence checks for the
//! verifier. [`ActionRegistry`] is the single place handlers are registered,
//! one per [`Action`] variant.

pub mod script;

use crate::core::types::{Action, Params, ResourceRef, ResultMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Reply from one action invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(result: ResultMap) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The external collaborator that performs actions.
///
/// `invoke` is synchronous and may block; the executor calls it from a
/// blocking pool.
pub trait ActionExecutor: Send + Sync {
    fn invoke(&self, action: Action, params: &Params) -> ActionOutcome;

    /// Whether `reference` exists in the live system. Read-only.
    fn lookup(&self, reference: &ResourceRef) -> Result<bool, String>;
}

/// Handler for a single action.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, params: &Params) -> ActionOutcome;
}

impl<F> ActionHandler for F
where
    F: Fn(&Params) -> ActionOutcome + Send + Sync,
{
    fn handle(&self, params: &Params) -> ActionOutcome {
        self(params)
    }
}

/// Read-only existence check used by the verifier.
pub trait ResourceProbe: Send + Sync {
    fn exists(&self, reference: &ResourceRef) -> Result<bool, String>;
}

impl<F> ResourceProbe for F
where
    F: Fn(&ResourceRef) -> Result<bool, String> + Send + Sync,
{
    fn exists(&self, reference: &ResourceRef) -> Result<bool, String> {
        self(reference)
    }
}

/// Handlers keyed by action, plus the probe for lookups.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<Action, Arc<dyn ActionHandler>>,
    probe: Option<Arc<dyn ResourceProbe>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&Action> = self.handlers.keys().collect();
        actions.sort();
        f.debug_struct("ActionRegistry")
            .field("actions", &actions)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, action: Action, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.insert(action, Arc::new(handler));
        self
    }

    pub fn with_probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Every action routed to the external script.
    pub fn scripted(script: script::ScriptExecutor) -> Self {
        let script = Arc::new(script);
        let mut registry = Self::new();
        for action in Action::ALL {
            let runner = Arc::clone(&script);
            registry = registry.with_handler(action, move |params: &Params| {
                runner.run(action, params)
            });
        }
        let prober = Arc::clone(&script);
        registry.with_probe(move |reference: &ResourceRef| prober.lookup(reference))
    }

    pub fn handles(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }
}

impl ActionExecutor for ActionRegistry {
    fn invoke(&self, action: Action, params: &Params) -> ActionOutcome {
        match self.handlers.get(&action) {
            Some(handler) => handler.handle(params),
            None => ActionOutcome::failed(format!("no handler registered for action '{}'", action)),
        }
    }

    fn lookup(&self, reference: &ResourceRef) -> Result<bool, String> {
        match &self.probe {
            Some(probe) => probe.exists(reference),
            None => Err("no resource probe registered".to_string()),
        }
    }
}
