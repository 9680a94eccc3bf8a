//! In-process job event stream backed by a `tokio::sync::broadcast` channel.
//!
//! Workers and the controller publish a [`JobEvent`] at every lifecycle
//! transition; the CLI progress display and [`wait_for`] listen to them.
//!
//! [`wait_for`]: crate::controller::JobController::wait_for

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state_machine::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEventKind {
    Queued { priority: i32 },
    Started,
    StepStarted { step_id: String, attempt: u32 },
    StepCompleted { step_id: String, percentage: u8 },
    StepRetrying {
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Completed,
    Failed { step_id: String, error: String },
    Cancelled,
    Requeued { retry_count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, kind: JobEventKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// The status the job ends up in, for events that close a run.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self.kind {
            JobEventKind::Completed => Some(JobStatus::Completed),
            JobEventKind::Failed { .. } => Some(JobStatus::Failed),
            JobEventKind::Cancelled => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus; every subscriber sees every event published after it
/// subscribed. Slow subscribers observe `RecvError::Lagged`.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: JobEvent) {
        // A send error only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, job_id: &str, kind: JobEventKind) {
        self.publish(JobEvent::new(job_id, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
