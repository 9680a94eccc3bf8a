//! Public façade of the engine: create, query, cancel and retry jobs.
//!
//! Client-input errors (`TemplateNotFound`, `InvalidParams`, `InvalidState`,
//! ...) are returned synchronously and nothing is written when they occur.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::admission::{AdmissionPolicy, AdmissionRequest};
use crate::error::EngineError;
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::scheduler::JobQueue;
use crate::state_machine::{Job, JobStatus, Params, StateMachine};
use crate::store::{JobFilter, JobStore};
use crate::template::{Template, TemplateRegistry};

/// Request to instantiate a template.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub template_id: String,
    pub params: Params,
    /// Higher is served first. Defaults to the engine's default priority.
    pub priority: Option<i32>,
    /// Explicit job-level retries allowed after a failure.
    pub max_retries: Option<u32>,
}

impl CreateJob {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            params: Params::new(),
            priority: None,
            max_retries: None,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Jobs created together from one template and many inputs.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub queue_length: usize,
    pub jobs_by_status: BTreeMap<JobStatus, usize>,
    /// Mean run time of completed jobs; `None` until one completes.
    pub average_duration_ms: Option<f64>,
}

impl EngineStats {
    /// Counts jobs persisted as `Queued` as the queue length, for readers
    /// that hold no live queue (a status command run beside the engine).
    pub fn with_stored_queue_length(mut self) -> Self {
        self.queue_length = self
            .jobs_by_status
            .get(&JobStatus::Queued)
            .copied()
            .unwrap_or_default();
        self
    }
}

pub struct JobController {
    templates: Arc<TemplateRegistry>,
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    admission: Vec<Box<dyn AdmissionPolicy>>,
    default_priority: i32,
    default_max_retries: u32,
    // Serializes cancel/retry so a job is never admitted twice.
    control: Mutex<()>,
}

impl JobController {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            templates,
            store,
            queue,
            events,
            admission: Vec::new(),
            default_priority: 0,
            default_max_retries: 3,
            control: Mutex::new(()),
        }
    }

    pub fn with_admission(mut self, policies: Vec<Box<dyn AdmissionPolicy>>) -> Self {
        self.admission = policies;
        self
    }

    pub fn with_defaults(mut self, priority: i32, max_retries: u32) -> Self {
        self.default_priority = priority;
        self.default_max_retries = max_retries;
        self
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Template lookup, param merge and required-key validation.
    fn prepare(&self, template_id: &str, params: Params) -> Result<(Arc<Template>, Params), EngineError> {
        let template = self.templates.get(template_id)?;
        let merged = template.merge_params(params);
        template.validate_params(&merged)?;
        Ok((template, merged))
    }

    fn admit_check(&self, request: &AdmissionRequest<'_>) -> Result<(), EngineError> {
        let template = request.template;
        for policy in &self.admission {
            if let Err(reason) = policy.check(request) {
                tracing::info!(
                    template_id = %template.id,
                    policy = policy.name(),
                    reason = %reason,
                    "Job rejected by admission policy",
                );
                return Err(EngineError::AdmissionRejected(reason));
            }
        }
        Ok(())
    }

    fn record_admission(&self, template: &Template, now: DateTime<Utc>) {
        for policy in &self.admission {
            policy.record(template, now);
        }
    }

    fn emit_queued(&self, job: &Job) {
        self.events.emit(
            &job.id,
            JobEventKind::Queued {
                priority: job.priority,
            },
        );
    }

    fn enqueue(&self, job: &Job) -> Result<(), EngineError> {
        self.queue.enqueue(&job.id, job.priority)?;
        self.emit_queued(job);
        Ok(())
    }

    /// Persists a new job and hands it to the queue. A job the queue
    /// refuses is removed again.
    fn persist_and_enqueue(&self, job: &Job) -> Result<(), EngineError> {
        self.store.create(job)?;
        if let Err(e) = self.enqueue(job) {
            if let Err(delete_err) = self.store.delete(&job.id) {
                tracing::error!(job_id = %job.id, error = %delete_err, "Failed to remove rejected job");
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn create_job(&self, request: CreateJob) -> Result<Job, EngineError> {
        let (template, params) = self.prepare(&request.template_id, request.params)?;
        self.queue.ensure_capacity(1)?;
        let now = Utc::now();
        self.admit_check(&AdmissionRequest::new(&template, &params, now))?;

        let job = Job::new(
            &template,
            params,
            request.priority.unwrap_or(self.default_priority),
            request.max_retries.unwrap_or(self.default_max_retries),
        );
        self.persist_and_enqueue(&job)?;
        self.record_admission(&template, now);

        tracing::info!(
            job_id = %job.id,
            template_id = %job.template_id,
            priority = job.priority,
            steps = job.steps.len(),
            "Job created",
        );
        Ok(job)
    }

    /// One job per input, all sharing a batch id. Every input is validated
    /// before anything is written; one bad input rejects the whole batch.
    pub fn create_batch(
        &self,
        template_id: &str,
        inputs: Vec<Params>,
        priority: Option<i32>,
        max_retries: Option<u32>,
    ) -> Result<Batch, EngineError> {
        if inputs.is_empty() {
            return Err(EngineError::InvalidParams("batch has no inputs".into()));
        }

        let mut prepared = Vec::with_capacity(inputs.len());
        for (index, params) in inputs.into_iter().enumerate() {
            let (template, merged) = self.prepare(template_id, params).map_err(|e| match e {
                EngineError::InvalidParams(msg) => {
                    EngineError::InvalidParams(format!("batch input #{index}: {msg}"))
                }
                other => other,
            })?;
            prepared.push((template, merged));
        }
        self.queue.ensure_capacity(prepared.len())?;
        let now = Utc::now();
        for (index, (template, params)) in prepared.iter().enumerate() {
            self.admit_check(&AdmissionRequest::new(template, params, now).with_pending(index))?;
        }

        let batch_id = Uuid::new_v4().to_string();
        let mut job_ids = Vec::with_capacity(prepared.len());
        for (template, params) in prepared {
            let job = Job::new(
                &template,
                params,
                priority.unwrap_or(self.default_priority),
                max_retries.unwrap_or(self.default_max_retries),
            )
            .with_batch(&batch_id);
            self.persist_and_enqueue(&job)?;
            self.record_admission(&template, now);
            job_ids.push(job.id);
        }

        tracing::info!(
            batch_id = %batch_id,
            template_id = %template_id,
            jobs = job_ids.len(),
            "Batch created",
        );
        Ok(Batch {
            id: batch_id,
            job_ids,
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.store.get(job_id)
    }

    /// Matching jobs, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        self.store.list(filter)
    }

    /// Cancels a queued or running job.
    ///
    /// A job still waiting in the queue is cancelled on the spot with no
    /// step touched. A running job gets its cancellation flag raised and
    /// stops at its next step boundary.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), EngineError> {
        let _guard = self.lock_control();
        let job = self.store.get(job_id)?;
        if job.is_terminal() {
            return Err(invalid_state(&job, "cancel"));
        }

        if self.queue.remove(job_id) {
            return self.cancel_queued(job_id);
        }
        if self.queue.signal_cancel(job_id) {
            tracing::info!(job_id = %job_id, "Cancellation requested");
            return Ok(());
        }

        // Neither waiting nor admitted: it either finished meanwhile or was
        // never handed to the queue.
        let job = self.store.get(job_id)?;
        match job.status {
            JobStatus::Queued => self.cancel_queued(job_id),
            _ => Err(invalid_state(&job, "cancel")),
        }
    }

    fn cancel_queued(&self, job_id: &str) -> Result<(), EngineError> {
        let mut job = self.store.get(job_id)?;
        StateMachine::cancel_queued(&mut job)?;
        self.store.update(&job)?;
        self.events.emit(&job.id, JobEventKind::Cancelled);
        tracing::info!(job_id = %job_id, "Queued job cancelled");
        Ok(())
    }

    /// Re-queues a failed job from its failed step, keeping the results of
    /// the steps that already completed.
    ///
    /// The `Queued` record is committed before the queue sees the job, so a
    /// worker never dequeues a job whose record still reads `Failed`. If the
    /// queue refuses it, the `Failed` record is restored.
    pub fn retry_job(&self, job_id: &str) -> Result<(), EngineError> {
        let _guard = self.lock_control();
        let original = self.store.get(job_id)?;
        let mut job = original.clone();
        StateMachine::requeue(&mut job)?;
        self.store.update(&job)?;
        if let Err(e) = self.queue.enqueue(&job.id, job.priority) {
            self.store.update(&original)?;
            tracing::warn!(job_id = %job.id, error = %e, "Retry refused by the queue");
            return Err(e);
        }
        self.events.emit(
            &job.id,
            JobEventKind::Requeued {
                retry_count: job.retry_count,
            },
        );
        self.emit_queued(&job);
        tracing::info!(
            job_id = %job.id,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            "Job re-queued",
        );
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let jobs = self.store.list(&JobFilter::default())?;
        let mut jobs_by_status: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for job in &jobs {
            *jobs_by_status.entry(job.status).or_default() += 1;
        }

        let durations: Vec<i64> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .filter_map(Job::duration_ms)
            .collect();
        let average_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        Ok(EngineStats {
            total_jobs: jobs.len(),
            active_jobs: jobs_by_status[&JobStatus::Running],
            queue_length: self.queue.len(),
            jobs_by_status,
            average_duration_ms,
        })
    }

    /// Re-admits jobs persisted as `Queued`, oldest first, regardless of the
    /// queue bound: they were accepted before the restart. Jobs found
    /// `Running` were interrupted mid-run and are left for reconciliation.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let mut queued = self.store.list(&JobFilter::status(JobStatus::Queued))?;
        queued.reverse();
        for job in &queued {
            self.queue.restore(&job.id, job.priority);
            self.emit_queued(job);
        }

        let interrupted = self.store.list(&JobFilter::status(JobStatus::Running))?;
        if !interrupted.is_empty() {
            tracing::warn!(
                jobs = interrupted.len(),
                "Jobs left RUNNING by a previous run need reconciliation",
            );
        }
        if !queued.is_empty() {
            tracing::info!(jobs = queued.len(), "Recovered queued jobs");
        }
        Ok(queued.len())
    }

    /// Resolves once the job reaches a terminal state.
    pub async fn wait_for(&self, job_id: &str) -> Result<Job, EngineError> {
        let mut rx = self.events.subscribe();
        loop {
            let job = self.store.get(job_id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.job_id != job_id => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return self.store.get(job_id),
                }
            }
        }
    }
}

fn invalid_state(job: &Job, action: &'static str) -> EngineError {
    EngineError::InvalidState {
        job_id: job.id.clone(),
        status: job.status,
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RateLimit;
    use crate::state_machine::{StepError, StepStatus, FailureKind};
    use crate::store::MemoryJobStore;
    use crate::test_support::{TEST_TEMPLATES, params};
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryJobStore>,
        queue: Arc<JobQueue>,
        controller: JobController,
    }

    fn harness_with_queue(max_len: Option<usize>) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(JobQueue::new(max_len));
        let controller = JobController::new(
            Arc::new(TemplateRegistry::from_toml_str(TEST_TEMPLATES).unwrap()),
            store.clone(),
            queue.clone(),
            Arc::new(EventBus::default()),
        );
        Harness {
            store,
            queue,
            controller,
        }
    }

    fn harness() -> Harness {
        harness_with_queue(None)
    }

    /// Marks a job as failed on `step_index`, with earlier steps completed.
    fn fail_job(h: &Harness, job_id: &str, step_index: usize) {
        let mut job = h.store.get(job_id).unwrap();
        job.status = JobStatus::Failed;
        for (i, step) in job.steps.iter_mut().enumerate() {
            if i < step_index {
                step.status = StepStatus::Completed;
                step.attempt = 1;
                step.result = Some(json!({"index": i}));
            } else if i == step_index {
                step.status = StepStatus::Failed;
                step.attempt = 2;
                step.error = Some(StepError {
                    kind: FailureKind::Service,
                    message: "boom".into(),
                });
            }
        }
        job.refresh_progress();
        h.store.update(&job).unwrap();
    }

    #[test]
    fn created_job_is_queued_with_pending_steps_in_order() {
        let h = harness();
        let job = h
            .controller
            .create_job(CreateJob::new("etl").with_priority(4).with_max_retries(1))
            .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 4);
        assert_eq!(job.max_retries, 1);
        let ids: Vec<&str> = job.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["fetch", "transform", "store"]);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.controller.get_job(&job.id).unwrap().id, job.id);
    }

    #[test]
    fn defaults_apply_when_request_leaves_them_out() {
        let h = harness();
        let controller = h.controller.with_defaults(2, 7);
        let job = controller.create_job(CreateJob::new("etl")).unwrap();
        assert_eq!(job.priority, 2);
        assert_eq!(job.max_retries, 7);
    }

    #[test]
    fn params_merge_over_template_defaults() {
        let h = harness();
        let job = h
            .controller
            .create_job(
                CreateJob::new("research").with_params(params(json!({"topic": "rust", "depth": 5}))),
            )
            .unwrap();
        assert_eq!(job.params["topic"], "rust");
        assert_eq!(job.params["depth"], 5);
        assert_eq!(job.params["language"], "en");
    }

    #[test]
    fn missing_required_param_is_rejected_without_write() {
        let h = harness();
        let err = h
            .controller
            .create_job(CreateJob::new("research"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams(_)));
        assert!(h.store.list(&JobFilter::default()).unwrap().is_empty());
        assert!(h.queue.is_empty());
    }

    #[test]
    fn unknown_template_is_client_error() {
        let h = harness();
        let err = h.controller.create_job(CreateJob::new("nope")).unwrap_err();
        assert!(matches!(err, EngineError::TemplateNotFound(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn full_queue_rejects_without_write() {
        let h = harness_with_queue(Some(1));
        h.controller.create_job(CreateJob::new("etl")).unwrap();
        let err = h.controller.create_job(CreateJob::new("etl")).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { capacity: 1 }));
        assert_eq!(h.store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn admission_policy_rejects_before_write() {
        let h = harness();
        let controller = h.controller.with_admission(vec![Box::new(RateLimit::new(
            1,
            chrono::Duration::seconds(3600),
            false,
        ))]);
        controller.create_job(CreateJob::new("etl")).unwrap();
        let err = controller.create_job(CreateJob::new("etl")).unwrap_err();
        assert!(matches!(err, EngineError::AdmissionRejected(_)));
        assert_eq!(h.store.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn rejected_batch_takes_no_rate_limit_slot() {
        let h = harness();
        let controller = h.controller.with_admission(vec![Box::new(RateLimit::new(
            2,
            chrono::Duration::seconds(3600),
            false,
        ))]);

        let err = controller
            .create_batch("etl", vec![Params::new(), Params::new(), Params::new()], None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmissionRejected(_)));
        assert!(h.store.list(&JobFilter::default()).unwrap().is_empty());

        // Both slots are still free.
        controller.create_job(CreateJob::new("etl")).unwrap();
        controller.create_job(CreateJob::new("etl")).unwrap();
        assert!(controller.create_job(CreateJob::new("etl")).is_err());
        assert_eq!(h.store.list(&JobFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn cancelling_queued_job_touches_no_step() {
        let h = harness();
        let job = h.controller.create_job(CreateJob::new("etl")).unwrap();

        h.controller.cancel_job(&job.id).unwrap();

        let stored = h.controller.get_job(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.steps, job.steps);
        assert!(h.queue.is_empty());

        let err = h.controller.cancel_job(&job.id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                status: JobStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn cancelling_dequeued_job_raises_its_flag() {
        let h = harness();
        let job = h.controller.create_job(CreateJob::new("etl")).unwrap();
        let entry = h.queue.try_dequeue().unwrap();
        let token = h.queue.cancellation_token(&entry).unwrap();

        h.controller.cancel_job(&job.id).unwrap();
        assert!(token.is_cancelled());
        // The worker owns the record now; the status changes at its next boundary.
        assert_eq!(h.controller.get_job(&job.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn cancelling_terminal_job_is_invalid() {
        let h = harness();
        let job = h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.queue.try_dequeue().unwrap();
        fail_job(&h, &job.id, 0);

        let err = h.controller.cancel_job(&job.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { action: "cancel", .. }));
        assert!(matches!(
            h.controller.cancel_job("missing"),
            Err(EngineError::JobNotFound(_))
        ));
    }

    #[test]
    fn retry_resets_failed_and_later_steps_only() {
        let h = harness();
        let job = h
            .controller
            .create_job(CreateJob::new("etl").with_priority(6).with_max_retries(1))
            .unwrap();
        let entry = h.queue.try_dequeue().unwrap();
        h.queue.release(&entry);
        fail_job(&h, &job.id, 1);
        let before = h.controller.get_job(&job.id).unwrap();

        h.controller.retry_job(&job.id).unwrap();

        let after = h.controller.get_job(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Queued);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.steps[0], before.steps[0]);
        assert_eq!(after.steps[1].status, StepStatus::Pending);
        assert_eq!(after.steps[1].attempt, 0);
        assert!(after.steps[1].error.is_none());
        assert_eq!(after.steps[2].status, StepStatus::Pending);

        let requeued = h.queue.try_dequeue().unwrap();
        assert_eq!(requeued.job_id, job.id);
        assert_eq!(requeued.priority, 6);

        // Budget of one retry is now spent.
        fail_job(&h, &job.id, 1);
        let err = h.controller.retry_job(&job.id).unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { .. }));
    }

    #[test]
    fn retry_refused_by_full_queue_keeps_failed_record() {
        let h = harness_with_queue(Some(1));
        let job = h
            .controller
            .create_job(CreateJob::new("etl").with_max_retries(1))
            .unwrap();
        let entry = h.queue.try_dequeue().unwrap();
        h.queue.release(&entry);
        fail_job(&h, &job.id, 1);
        let before = h.controller.get_job(&job.id).unwrap();
        h.controller.create_job(CreateJob::new("etl")).unwrap();

        let err = h.controller.retry_job(&job.id).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { capacity: 1 }));
        let after = h.controller.get_job(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.retry_count, 0);
        assert_eq!(after.steps, before.steps);

        // Once there is room the retry goes through.
        h.queue.try_dequeue().unwrap();
        h.controller.retry_job(&job.id).unwrap();
        assert_eq!(h.controller.get_job(&job.id).unwrap().retry_count, 1);
        assert_eq!(h.queue.try_dequeue().unwrap().job_id, job.id);
    }

    #[test]
    fn retry_requires_failed_status() {
        let h = harness();
        let job = h.controller.create_job(CreateJob::new("etl")).unwrap();
        let err = h.controller.retry_job(&job.id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                status: JobStatus::Queued,
                action: "retry",
                ..
            }
        ));
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let h = harness();
        let first = h.controller.create_job(CreateJob::new("etl")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = h
            .controller
            .create_job(CreateJob::new("research").with_params(params(json!({"topic": "x"}))))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.controller.cancel_job(&third.id).unwrap();

        let all = h.controller.list_jobs(&JobFilter::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]);

        let etl = h
            .controller
            .list_jobs(&JobFilter {
                template_id: Some("etl".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(etl.len(), 2);

        let queued = h
            .controller
            .list_jobs(&JobFilter::status(JobStatus::Queued))
            .unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let h = harness();
        let err = h
            .controller
            .create_batch(
                "research",
                vec![params(json!({"topic": "a"})), Params::new()],
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams(ref msg) if msg.starts_with("batch input #1")));
        assert!(h.store.list(&JobFilter::default()).unwrap().is_empty());

        let batch = h
            .controller
            .create_batch(
                "research",
                vec![params(json!({"topic": "a"})), params(json!({"topic": "b"}))],
                Some(3),
                None,
            )
            .unwrap();
        assert_eq!(batch.job_ids.len(), 2);
        let members = h
            .controller
            .list_jobs(&JobFilter {
                batch_id: Some(batch.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|j| j.priority == 3));

        // Input order is preserved in the queue.
        assert_eq!(h.queue.try_dequeue().unwrap().job_id, batch.job_ids[0]);
        assert_eq!(h.queue.try_dequeue().unwrap().job_id, batch.job_ids[1]);

        assert!(h.controller.create_batch("research", Vec::new(), None, None).is_err());
    }

    #[test]
    fn stats_count_by_status() {
        let h = harness();
        let a = h.controller.create_job(CreateJob::new("etl")).unwrap();
        let b = h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.controller.cancel_job(&a.id).unwrap();

        let mut done = h.store.get(&b.id).unwrap();
        h.queue.remove(&b.id);
        done.status = JobStatus::Completed;
        done.started_at = Some(done.created_at);
        done.completed_at = Some(done.created_at + chrono::Duration::milliseconds(1500));
        h.store.update(&done).unwrap();

        let stats = h.controller.stats().unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.active_jobs, 0);
        assert_eq!(stats.queue_length, 1);
        assert_eq!(stats.jobs_by_status[&JobStatus::Queued], 1);
        assert_eq!(stats.jobs_by_status[&JobStatus::Cancelled], 1);
        assert_eq!(stats.jobs_by_status[&JobStatus::Completed], 1);
        assert_eq!(stats.jobs_by_status[&JobStatus::Failed], 0);
        assert_eq!(stats.average_duration_ms, Some(1500.0));
    }

    #[test]
    fn stats_without_live_queue_report_stored_queued_jobs() {
        let h = harness();
        h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.controller.create_job(CreateJob::new("etl")).unwrap();

        // A reader over the same store with a queue of its own.
        let reader = JobController::new(
            Arc::new(TemplateRegistry::from_toml_str(TEST_TEMPLATES).unwrap()),
            h.store.clone(),
            Arc::new(JobQueue::new(None)),
            Arc::new(EventBus::default()),
        );
        let stats = reader.stats().unwrap();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.with_stored_queue_length().queue_length, 2);
    }

    #[test]
    fn recover_requeues_persisted_jobs_oldest_first() {
        let h = harness();
        let first = h.controller.create_job(CreateJob::new("etl")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = h.controller.create_job(CreateJob::new("etl")).unwrap();
        // Simulate a restart: the in-memory queue is gone, the store is not.
        while h.queue.try_dequeue().is_some() {}

        assert_eq!(h.controller.recover().unwrap(), 2);
        assert_eq!(h.queue.try_dequeue().unwrap().job_id, first.id);
        assert_eq!(h.queue.try_dequeue().unwrap().job_id, second.id);
    }

    #[test]
    fn recover_readmits_past_the_queue_bound() {
        let h = harness_with_queue(Some(2));
        h.controller.create_job(CreateJob::new("etl")).unwrap();
        h.controller.create_job(CreateJob::new("etl")).unwrap();
        // A third job accepted by an earlier run with a larger bound.
        let template = h.controller.templates().get("etl").unwrap();
        h.store.create(&Job::new(&template, Params::new(), 0, 1)).unwrap();
        while h.queue.try_dequeue().is_some() {}

        assert_eq!(h.controller.recover().unwrap(), 3);
        assert_eq!(h.queue.len(), 3);
        assert!(matches!(
            h.controller.create_job(CreateJob::new("etl")),
            Err(EngineError::QueueFull { capacity: 2 })
        ));
    }
}
