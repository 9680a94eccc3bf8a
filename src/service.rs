//! The boundary between the engine and the services its steps invoke.
//!
//! A template step names a binding (`service = "scraper"`); the
//! [`ServiceRegistry`] resolves that name to a [`Service`] implementation.
//! The engine never looks inside a service: it only hands over the step
//! context and waits for an output or an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::state_machine::Params;

/// Everything a service gets to see about the step it runs.
#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    pub job_id: String,
    pub step_id: String,
    pub attempt: u32,
    /// Job params (template defaults merged with caller params).
    pub params: Params,
    /// Results of the earlier steps this step declared as inputs.
    pub inputs: Params,
}

/// What a service hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOutput {
    pub result: Value,
    /// Cost contributed to the job's accumulator (tokens, credits, ...).
    #[serde(default)]
    pub cost: f64,
}

impl ServiceOutput {
    pub fn new(result: Value) -> Self {
        Self { result, cost: 0.0 }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Failed(String),
}

/// A concrete unit of work a step can be bound to.
///
/// `deadline` is informational: the dispatcher abandons the call when it
/// passes, whether or not the service honours it.
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &StepContext,
        deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError>;
}

/// Binding name -> service.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: impl Into<String>, service: Arc<dyn Service>) {
        self.services.insert(binding.into(), service);
    }

    pub fn with(mut self, binding: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.register(binding, service);
        self
    }

    pub fn get(&self, binding: &str) -> Option<Arc<dyn Service>> {
        self.services.get(binding).cloned()
    }

    pub fn contains(&self, binding: &str) -> bool {
        self.services.contains_key(binding)
    }

    pub fn bindings(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("bindings", &self.bindings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedService;

    #[test]
    fn registry_resolves_bindings() {
        let registry = ServiceRegistry::new()
            .with("writer", Arc::new(ScriptedService::always_ok()))
            .with("scraper", Arc::new(ScriptedService::always_ok()));

        assert!(registry.contains("writer"));
        assert!(registry.get("scraper").is_some());
        assert!(registry.get("renderer").is_none());
        assert_eq!(registry.bindings(), vec!["scraper", "writer"]);
    }

    #[test]
    fn output_builder_sets_cost() {
        let out = ServiceOutput::new(serde_json::json!({"ok": true})).with_cost(0.25);
        assert_eq!(out.cost, 0.25);
        assert_eq!(out.result["ok"], true);
    }
}
