use std::sync::Arc;

use tokio::task::JoinError;
use tokio::time::{Instant, timeout};

use crate::error::EngineError;
use crate::service::{ServiceOutput, ServiceRegistry, StepContext};
use crate::template::StepDefinition;

/// Invokes the service bound to a step and enforces the step deadline.
///
/// There is no retry logic here; a failed dispatch is reported once and the
/// worker decides what to do with it.
#[derive(Debug, Clone)]
pub struct StepDispatcher {
    services: Arc<ServiceRegistry>,
}

impl StepDispatcher {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    /// Returns the service output, `DispatchTimeout` when the deadline
    /// passes first (the call is aborted and a late answer dropped), or
    /// `DispatchFailure` when the service errors, panics or nothing is bound.
    pub async fn dispatch(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
    ) -> Result<ServiceOutput, EngineError> {
        let service = self
            .services
            .get(&step.service)
            .ok_or_else(|| EngineError::DispatchFailure {
                step_id: step.id.clone(),
                message: format!("no service bound to `{}`", step.service),
            })?;

        let deadline = Instant::now() + step.timeout();
        tracing::debug!(
            job_id = %ctx.job_id,
            step_id = %step.id,
            service = %step.service,
            attempt = ctx.attempt,
            timeout_ms = step.timeout_ms,
            external = step.requires_external_call,
            "Dispatching step",
        );

        // The call runs on its own task so a panicking service fails the
        // step instead of unwinding through the worker.
        let step_name = step.name.clone();
        let call_ctx = ctx.clone();
        let mut call =
            tokio::spawn(async move { service.invoke(&step_name, &call_ctx, deadline).await });

        match timeout(step.timeout(), &mut call).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(EngineError::DispatchFailure {
                step_id: step.id.clone(),
                message: e.to_string(),
            }),
            Ok(Err(join_err)) => {
                let message = panic_message(join_err);
                tracing::error!(
                    job_id = %ctx.job_id,
                    step_id = %step.id,
                    error = %message,
                    "Service call did not finish",
                );
                Err(EngineError::DispatchFailure {
                    step_id: step.id.clone(),
                    message,
                })
            }
            Err(_) => {
                call.abort();
                Err(EngineError::DispatchTimeout {
                    step_id: step.id.clone(),
                    timeout_ms: step.timeout_ms,
                })
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "service call was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("service panicked: {detail}")
}
