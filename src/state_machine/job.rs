use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::service::ServiceOutput;
use crate::template::Template;

/// Caller-supplied configuration, merged over a template's defaults.
pub type Params = serde_json::Map<String, Value>;

/// Distinguishes a step that ran out of time from one its service rejected.
/// Both are retryable under the step's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The bound service did not answer before the step deadline.
    Timeout,
    /// The bound service answered with an error (or no service is bound).
    Service,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "Timeout"),
            FailureKind::Service => write!(f, "Service"),
        }
    }
}

/// Error recorded on a [`StepRun`] after a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// The step id already lives on the [`StepRun`], so only the cause is kept.
impl From<&EngineError> for StepError {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::DispatchTimeout { timeout_ms, .. } => Self {
                kind: FailureKind::Timeout,
                message: format!("timed out after {timeout_ms}ms"),
            },
            EngineError::DispatchFailure { message, .. } => Self {
                kind: FailureKind::Service,
                message: message.clone(),
            },
            other => Self {
                kind: FailureKind::Service,
                message: other.to_string(),
            },
        }
    }
}

/// The result of dispatching one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(ServiceOutput),
    Failure(StepError),
}

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failure(StepError),
    Cancelled,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal status moves. `Failed -> Queued` is the only way out of a
    /// terminal state and is reserved for an explicit retry.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
                | (JobStatus::Failed, JobStatus::Queued)
        )
    }

    fn action(self) -> &'static str {
        match self {
            JobStatus::Queued => "requeue",
            JobStatus::Running => "start",
            JobStatus::Completed => "complete",
            JobStatus::Failed => "fail",
            JobStatus::Cancelled => "cancel",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Per-step retry behaviour, declared on the step definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether the step is safe to re-run. Non-idempotent steps are never
    /// retried automatically.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    /// Extra attempts allowed after the first failure.
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    /// Fixed delay in milliseconds before re-running a failed step.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_idempotent() -> bool {
    true
}

fn default_max_step_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            idempotent: default_idempotent(),
            max_step_retries: default_max_step_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Whether a step that just failed on `attempt` (1-based) may run again.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.idempotent && attempt <= self.max_step_retries
    }

    /// Delay before the retry that follows `attempt`. The backoff is fixed.
    pub fn delay_for_attempt(&self, _attempt: u32) -> u64 {
        self.backoff_ms
    }
}

/// Mutable execution record of one template step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<StepError>,
    pub attempt: u32,
}

impl StepRun {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            attempt: 0,
        }
    }

    /// Back to a never-run state, as done by an explicit job retry.
    pub fn reset(&mut self) {
        *self = Self::pending(std::mem::take(&mut self.step_id));
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percentage: u8,
}

impl Progress {
    pub fn new(completed_steps: usize, total_steps: usize) -> Self {
        let percentage = if total_steps == 0 {
            0
        } else {
            (completed_steps * 100 / total_steps) as u8
        };
        Self {
            completed_steps,
            total_steps,
            percentage,
        }
    }
}

/// One instantiation of a template bound to concrete parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub template_id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub steps: Vec<StepRun>,
    pub params: Params,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub cost: f64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Job {
    /// Materializes one pending [`StepRun`] per template step, in template order.
    pub fn new(template: &Template, params: Params, priority: i32, max_retries: u32) -> Self {
        let now = Utc::now();
        let steps: Vec<StepRun> = template
            .steps
            .iter()
            .map(|step| StepRun::pending(&step.id))
            .collect();
        let total = steps.len();
        Self {
            id: Uuid::new_v4().to_string(),
            template_id: template.id.clone(),
            batch_id: None,
            priority,
            status: JobStatus::Queued,
            steps,
            params,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            progress: Progress::new(0, total),
            cost: 0.0,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the job to `next`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidState {
                job_id: self.id.clone(),
                status: self.status,
                action: next.action(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn refresh_progress(&mut self) {
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.progress = Progress::new(completed, self.steps.len());
    }

    /// Index of the first step that still has to run.
    pub fn next_pending_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
    }

    pub fn failed_step(&self) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Results of the named, already completed steps keyed by step id.
    pub fn step_results(&self, step_ids: &[String]) -> Params {
        step_ids
            .iter()
            .filter_map(|id| {
                self.step(id)
                    .filter(|s| s.status == StepStatus::Completed)
                    .and_then(|s| s.result.clone())
                    .map(|result| (id.clone(), result))
            })
            .collect()
    }

    /// Wall-clock time of the latest run, once it has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Per-step line of a [`JobReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a job, produced once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: JobStatus,
    pub steps: Vec<StepSummary>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        let steps = job
            .steps
            .iter()
            .map(|s| StepSummary {
                step_id: s.step_id.clone(),
                status: s.status,
                attempt: s.attempt,
                duration_ms: s.duration_ms(),
                error: s.error.as_ref().map(|e| e.to_string()),
            })
            .collect();

        Self {
            job_id: job.id.clone(),
            template_id: job.template_id.clone(),
            batch_id: job.batch_id.clone(),
            status: job.status,
            steps,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            cost: job.cost,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms: job.duration_ms(),
        }
    }
}
