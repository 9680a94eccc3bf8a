use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::StepDispatcher;
use crate::error::EngineError;
use crate::events::{EventBus, JobEventKind};
use crate::service::StepContext;
use crate::state_machine::{
    Job, JobOutcome, JobReport, JobStatus, StateMachine, StepError, StepOutcome, Transition,
};
use crate::store::JobStore;
use crate::template::{Template, TemplateRegistry};

/// Drives one job through its steps, strictly in template order.
///
/// The orchestrator is the only writer of a job's record while it runs:
/// every state change is persisted before the next step is dispatched.
/// Storage errors abort the run and leave the job in its last committed
/// state.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    templates: Arc<TemplateRegistry>,
    dispatcher: StepDispatcher,
    events: Arc<EventBus>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        templates: Arc<TemplateRegistry>,
        dispatcher: StepDispatcher,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            templates,
            dispatcher,
            events,
        }
    }

    /// Run a queued job to a terminal state, returning its report.
    ///
    /// `cancel` is checked before the job starts, between steps and during
    /// a retry backoff, never while a step is being dispatched.
    pub async fn run_job(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobReport, EngineError> {
        let mut job = self.store.get(job_id)?;
        if job.status != JobStatus::Queued {
            return Err(EngineError::InvalidState {
                job_id: job.id,
                status: job.status,
                action: "start",
            });
        }
        let template = self.templates.get(&job.template_id)?;
        check_steps_match(&job, &template)?;

        if cancel.is_cancelled() {
            return self.cancel(&mut job);
        }

        StateMachine::start(&mut job)?;
        self.store.update(&job)?;
        self.events.emit(&job.id, JobEventKind::Started);
        tracing::info!(
            job_id = %job.id,
            template_id = %job.template_id,
            retry_count = job.retry_count,
            "Job started",
        );

        while let Some(index) = job.next_pending_step() {
            if cancel.is_cancelled() {
                return self.cancel(&mut job);
            }

            let step = &template.steps[index];
            loop {
                StateMachine::begin_step(&mut job, index);
                self.store.update(&job)?;
                let attempt = job.steps[index].attempt;
                self.events.emit(
                    &job.id,
                    JobEventKind::StepStarted {
                        step_id: step.id.clone(),
                        attempt,
                    },
                );

                let ctx = StepContext {
                    job_id: job.id.clone(),
                    step_id: step.id.clone(),
                    attempt,
                    params: job.params.clone(),
                    inputs: job.step_results(&step.inputs),
                };
                let outcome = match self.dispatcher.dispatch(step, &ctx).await {
                    Ok(output) => StepOutcome::Success(output),
                    Err(e) if e.is_retryable() => StepOutcome::Failure(StepError::from(&e)),
                    Err(e) => return Err(e),
                };

                let transition = StateMachine::apply(&mut job, index, outcome, &step.retry)?;
                self.store.update(&job)?;

                match transition {
                    Transition::Next(_) => {
                        self.step_completed(&job, &step.id);
                        break;
                    }
                    Transition::Retry {
                        reason, delay_ms, ..
                    } => {
                        log_retry(&job.id, &step.id, attempt, step.retry.max_step_retries, &reason, delay_ms);
                        self.events.emit(
                            &job.id,
                            JobEventKind::StepRetrying {
                                step_id: step.id.clone(),
                                attempt,
                                delay_ms,
                                reason: reason.to_string(),
                            },
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return self.cancel(&mut job),
                            _ = sleep(Duration::from_millis(delay_ms)) => {}
                        }
                    }
                    Transition::Complete(JobOutcome::Failure(error)) => {
                        tracing::warn!(
                            job_id = %job.id,
                            step_id = %step.id,
                            attempt,
                            error = %error,
                            "Job failed",
                        );
                        self.events.emit(
                            &job.id,
                            JobEventKind::Failed {
                                step_id: step.id.clone(),
                                error: error.to_string(),
                            },
                        );
                        return Ok(JobReport::from_job(&job));
                    }
                    Transition::Complete(_) => {
                        self.step_completed(&job, &step.id);
                        return Ok(self.completed(&job));
                    }
                }
            }
        }

        // Nothing left to run: every step was already completed.
        if job.status == JobStatus::Running {
            job.transition(JobStatus::Completed)?;
            job.completed_at = Some(chrono::Utc::now());
            job.refresh_progress();
            self.store.update(&job)?;
        }
        Ok(self.completed(&job))
    }

    fn cancel(&self, job: &mut Job) -> Result<JobReport, EngineError> {
        StateMachine::cancel(job)?;
        self.store.update(job)?;
        self.events.emit(&job.id, JobEventKind::Cancelled);
        tracing::info!(
            job_id = %job.id,
            completed_steps = job.progress.completed_steps,
            "Job cancelled",
        );
        Ok(JobReport::from_job(job))
    }

    fn step_completed(&self, job: &Job, step_id: &str) {
        tracing::debug!(
            job_id = %job.id,
            step_id = %step_id,
            percentage = job.progress.percentage,
            "Step completed",
        );
        self.events.emit(
            &job.id,
            JobEventKind::StepCompleted {
                step_id: step_id.to_string(),
                percentage: job.progress.percentage,
            },
        );
    }

    fn completed(&self, job: &Job) -> JobReport {
        let report = JobReport::from_job(job);
        tracing::info!(
            job_id = %job.id,
            duration_ms = report.duration_ms.unwrap_or_default(),
            cost = job.cost,
            "Job completed",
        );
        self.events.emit(&job.id, JobEventKind::Completed);
        report
    }
}

fn check_steps_match(job: &Job, template: &Template) -> Result<(), EngineError> {
    let matches = job.steps.len() == template.steps.len()
        && job
            .steps
            .iter()
            .zip(&template.steps)
            .all(|(run, def)| run.step_id == def.id);
    if matches {
        Ok(())
    } else {
        Err(EngineError::InvalidTemplate {
            template_id: template.id.clone(),
            reason: format!("steps of job {} no longer match the template", job.id),
        })
    }
}

fn log_retry(job_id: &str, step_id: &str, attempt: u32, max: u32, reason: &StepError, delay_ms: u64) {
    tracing::warn!(
        job_id = %job_id,
        step_id = %step_id,
        "Retry {attempt}/{max}: {reason} (waiting {delay_ms}ms)",
    );
}
