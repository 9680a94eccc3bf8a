//! Stand-in services for running the built-in templates without any
//! external integration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::service::{Service, ServiceError, ServiceOutput, ServiceRegistry, StepContext};

/// Sleeps for a fixed latency, then echoes what it was asked to do.
#[derive(Debug, Clone)]
pub struct SimulatedService {
    latency: Duration,
    cost: f64,
}

impl SimulatedService {
    pub fn new(latency: Duration, cost: f64) -> Self {
        Self { latency, cost }
    }
}

#[async_trait]
impl Service for SimulatedService {
    async fn invoke(
        &self,
        step_name: &str,
        ctx: &StepContext,
        _deadline: Instant,
    ) -> Result<ServiceOutput, ServiceError> {
        tokio::time::sleep(self.latency).await;
        let inputs: Vec<&String> = ctx.inputs.keys().collect();
        Ok(ServiceOutput::new(json!({
            "step": step_name,
            "step_id": ctx.step_id,
            "attempt": ctx.attempt,
            "inputs": inputs,
            "topic": ctx.params.get("topic"),
        }))
        .with_cost(self.cost))
    }
}

/// Binds every service used by the built-in templates to a
/// [`SimulatedService`], scaling each one's latency from `base_latency`.
pub fn default_services(base_latency: Duration) -> ServiceRegistry {
    let bindings: [(&str, u32, f64); 5] = [
        ("scraper", 3, 0.02),
        ("analyzer", 2, 0.01),
        ("generator", 4, 0.05),
        ("renderer", 5, 0.08),
        ("scheduler", 1, 0.0),
    ];

    let mut registry = ServiceRegistry::new();
    for (binding, factor, cost) in bindings {
        registry.register(
            binding,
            Arc::new(SimulatedService::new(base_latency * factor, cost)),
        );
    }
    registry
}
