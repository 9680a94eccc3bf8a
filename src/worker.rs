//! Fixed-size pool of workers pulling from the shared [`JobQueue`].
//!
//! Each worker is a long-lived Tokio task. A job's run is spawned as its own
//! task so that a panic outside the service call only takes that job down;
//! the worker logs it and goes back to the queue. Service panics never get
//! this far: the dispatcher turns them into step failures.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::JobOrchestrator;
use crate::scheduler::{JobQueue, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
    pub total_processed: u64,
}

#[derive(Debug)]
struct WorkerSlot {
    stats: Mutex<WorkerStats>,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            stats: Mutex::new(WorkerStats {
                id,
                status: WorkerStatus::Idle,
                current_job_id: None,
                total_processed: 0,
            }),
        }
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    fn snapshot(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub struct WorkerPool {
    slots: Vec<Arc<WorkerSlot>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns `size` workers on the current Tokio runtime.
    pub fn spawn(size: usize, queue: Arc<JobQueue>, orchestrator: Arc<JobOrchestrator>) -> Self {
        let shutdown = CancellationToken::new();
        let slots: Vec<Arc<WorkerSlot>> = (0..size).map(|id| Arc::new(WorkerSlot::new(id))).collect();
        let handles = slots
            .iter()
            .map(|slot| {
                tokio::spawn(worker_loop(
                    Arc::clone(slot),
                    Arc::clone(&queue),
                    Arc::clone(&orchestrator),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = size, "Worker pool started");
        Self {
            slots,
            handles,
            shutdown,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Share of workers currently busy, in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.slots.is_empty() {
            return 0.0;
        }
        let busy = self
            .stats()
            .iter()
            .filter(|s| s.status == WorkerStatus::Busy)
            .count();
        busy as f64 / self.slots.len() as f64
    }

    /// Stops taking new jobs and waits for running jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    slot: Arc<WorkerSlot>,
    queue: Arc<JobQueue>,
    orchestrator: Arc<JobOrchestrator>,
    shutdown: CancellationToken,
) {
    let worker_id = slot.snapshot().id;
    tracing::debug!(worker_id, "Worker started");

    loop {
        let entry = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            entry = queue.dequeue() => entry,
        };

        slot.update(|s| {
            s.status = WorkerStatus::Busy;
            s.current_job_id = Some(entry.job_id.clone());
        });
        tracing::debug!(worker_id, job_id = %entry.job_id, priority = entry.priority, "Job dequeued");

        run_entry(&queue, &orchestrator, &entry, worker_id).await;
        queue.release(&entry);

        slot.update(|s| {
            s.status = WorkerStatus::Idle;
            s.current_job_id = None;
            s.total_processed += 1;
        });
    }

    tracing::debug!(worker_id, "Worker stopped");
}

async fn run_entry(
    queue: &JobQueue,
    orchestrator: &Arc<JobOrchestrator>,
    entry: &QueueEntry,
    worker_id: usize,
) {
    let token = queue.cancellation_token(entry).unwrap_or_default();
    let orchestrator = Arc::clone(orchestrator);
    let job_id = entry.job_id.clone();

    let run = tokio::spawn(async move { orchestrator.run_job(&job_id, &token).await });
    match run.await {
        Ok(Ok(report)) => {
            tracing::debug!(
                worker_id,
                job_id = %report.job_id,
                status = %report.status,
                "Job run finished",
            );
        }
        Ok(Err(e)) => {
            tracing::error!(
                worker_id,
                job_id = %entry.job_id,
                error = %e,
                "Job run aborted; record left in its last committed state",
            );
        }
        Err(e) => {
            tracing::error!(
                worker_id,
                job_id = %entry.job_id,
                error = %e,
                "Job run panicked; record left in its last committed state",
            );
        }
    }
}
