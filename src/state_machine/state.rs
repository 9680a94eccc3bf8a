use chrono::Utc;

use super::job::{Job, JobOutcome, JobStatus, RetryPolicy, StepError, StepOutcome, StepStatus};
use crate::error::EngineError;

/// The result of applying a step outcome to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the step at this index.
    Next(usize),
    /// Re-run the step at `index` after `delay_ms`.
    Retry {
        index: usize,
        reason: StepError,
        delay_ms: u64,
    },
    /// The job reached a terminal state.
    Complete(JobOutcome),
}

/// Drives a [`Job`] and its step runs through the lifecycle.
///
/// Every method mutates the job in memory only; persisting the result is
/// the caller's job.
pub struct StateMachine;

impl StateMachine {
    /// `Queued -> Running`.
    pub fn start(job: &mut Job) -> Result<(), EngineError> {
        job.transition(JobStatus::Running)?;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        Ok(())
    }

    /// Marks the step at `index` as running and counts the attempt.
    pub fn begin_step(job: &mut Job, index: usize) {
        let step = &mut job.steps[index];
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.ended_at = None;
        step.attempt += 1;
        job.touch();
    }

    /// Compute and apply the transition for the step at `index`.
    ///
    /// - Success completes the step and advances; after the last step the
    ///   job is `Completed`.
    /// - Failure retries while the policy allows it, otherwise the step and
    ///   the job are `Failed` and later steps stay `Pending`.
    pub fn apply(
        job: &mut Job,
        index: usize,
        outcome: StepOutcome,
        policy: &RetryPolicy,
    ) -> Result<Transition, EngineError> {
        let now = Utc::now();
        match outcome {
            StepOutcome::Success(output) => {
                let step = &mut job.steps[index];
                step.status = StepStatus::Completed;
                step.ended_at = Some(now);
                step.result = Some(output.result);
                step.error = None;
                job.cost += output.cost;
                job.refresh_progress();

                if index + 1 < job.steps.len() {
                    job.touch();
                    Ok(Transition::Next(index + 1))
                } else {
                    job.transition(JobStatus::Completed)?;
                    job.completed_at = Some(now);
                    Ok(Transition::Complete(JobOutcome::Success))
                }
            }
            StepOutcome::Failure(reason) => {
                let step = &mut job.steps[index];
                step.error = Some(reason.clone());
                if policy.allows_retry(step.attempt) {
                    let delay_ms = policy.delay_for_attempt(step.attempt);
                    job.touch();
                    return Ok(Transition::Retry {
                        index,
                        reason,
                        delay_ms,
                    });
                }

                step.status = StepStatus::Failed;
                step.ended_at = Some(now);
                job.transition(JobStatus::Failed)?;
                job.completed_at = Some(now);
                Ok(Transition::Complete(JobOutcome::Failure(reason)))
            }
        }
    }

    /// Cooperative cancellation observed at a step boundary or during a
    /// retry backoff: steps that have not finished are skipped and the job
    /// becomes `Cancelled`. A step caught between attempts keeps its last
    /// error.
    pub fn cancel(job: &mut Job) -> Result<Transition, EngineError> {
        job.transition(JobStatus::Cancelled)?;
        let now = Utc::now();
        for step in job.steps.iter_mut() {
            match step.status {
                StepStatus::Pending => step.status = StepStatus::Skipped,
                StepStatus::Running => {
                    step.status = StepStatus::Skipped;
                    step.ended_at = Some(now);
                }
                _ => {}
            }
        }
        job.completed_at = Some(now);
        Ok(Transition::Complete(JobOutcome::Cancelled))
    }

    /// Cancellation of a job no worker has picked up: no step is touched.
    pub fn cancel_queued(job: &mut Job) -> Result<(), EngineError> {
        if job.status != JobStatus::Queued {
            return Err(EngineError::InvalidState {
                job_id: job.id.clone(),
                status: job.status,
                action: "cancel",
            });
        }
        job.transition(JobStatus::Cancelled)?;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `Failed -> Queued`: the failed step and every later step go back to
    /// `Pending`; earlier completed steps keep their results.
    pub fn requeue(job: &mut Job) -> Result<(), EngineError> {
        if job.status != JobStatus::Failed {
            return Err(EngineError::InvalidState {
                job_id: job.id.clone(),
                status: job.status,
                action: "retry",
            });
        }
        if job.retry_count >= job.max_retries {
            return Err(EngineError::RetriesExhausted {
                job_id: job.id.clone(),
                retry_count: job.retry_count,
                max_retries: job.max_retries,
            });
        }

        let first_failed = job
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Failed)
            .unwrap_or(job.steps.len());
        for step in &mut job.steps[first_failed..] {
            step.reset();
        }

        job.transition(JobStatus::Queued)?;
        job.retry_count += 1;
        job.completed_at = None;
        job.refresh_progress();
        Ok(())
    }
}
