//! Wiring of the engine's parts into one running instance.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::controller::JobController;
use crate::dispatcher::StepDispatcher;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::orchestrator::JobOrchestrator;
use crate::scheduler::JobQueue;
use crate::service::ServiceRegistry;
use crate::store::JobStore;
use crate::template::TemplateRegistry;
use crate::worker::{WorkerPool, WorkerStats};

/// A started engine: one queue, one worker pool, one controller.
pub struct Engine {
    controller: Arc<JobController>,
    pool: WorkerPool,
}

impl Engine {
    /// Builds the engine and starts its workers on the current Tokio
    /// runtime. Jobs persisted as `Queued` are re-admitted before the
    /// first worker starts.
    pub fn start(
        config: &EngineConfig,
        templates: TemplateRegistry,
        services: ServiceRegistry,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, EngineError> {
        if templates.is_empty() {
            tracing::warn!("No templates loaded; every job request will be rejected");
        }
        for template in templates.list() {
            for binding in template.bindings() {
                if !services.contains(binding) {
                    tracing::warn!(
                        template_id = %template.id,
                        binding,
                        "No service registered for binding; its steps will fail",
                    );
                }
            }
        }

        let templates = Arc::new(templates);
        let events = Arc::new(EventBus::default());
        let queue = Arc::new(JobQueue::new(config.max_queue_length));

        let controller = Arc::new(
            JobController::new(
                Arc::clone(&templates),
                Arc::clone(&store),
                Arc::clone(&queue),
                Arc::clone(&events),
            )
            .with_admission(config.admission.build())
            .with_defaults(config.default_priority, config.default_max_retries),
        );
        controller.recover()?;

        let orchestrator = Arc::new(JobOrchestrator::new(
            store,
            templates,
            StepDispatcher::new(Arc::new(services)),
            events,
        ));
        let pool = WorkerPool::spawn(config.workers, queue, orchestrator);

        Ok(Self { controller, pool })
    }

    pub fn controller(&self) -> &Arc<JobController> {
        &self.controller
    }

    pub fn workers(&self) -> Vec<WorkerStats> {
        self.pool.stats()
    }

    pub fn utilization(&self) -> f64 {
        self.pool.utilization()
    }

    /// Idle workers exit at once; busy workers finish their current job.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
