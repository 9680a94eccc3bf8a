//! Priority admission of jobs into the worker pool.
//!
//! [`JobQueue`] orders waiting jobs by `(priority desc, enqueue order asc)`
//! and hands out one [`CancellationToken`] per admitted job, consulted by
//! the worker at every step boundary.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// A job waiting in (or just taken from) the queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: String,
    pub priority: i32,
    seq: u64,
}

impl QueueEntry {
    /// Admission sequence number; also identifies this admission's
    /// cancellation token.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then the earlier admission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    /// Tokens of every admitted job that has not been released yet, keyed
    /// by job id and tagged with the admission sequence.
    tokens: HashMap<String, (u64, CancellationToken)>,
}

impl QueueState {
    fn push(&mut self, job_id: &str, priority: i32) -> QueueEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueueEntry {
            job_id: job_id.to_string(),
            priority,
            seq,
        };
        self.heap.push(entry.clone());
        self.tokens
            .insert(job_id.to_string(), (seq, CancellationToken::new()));
        entry
    }
}

/// Shared priority queue feeding the worker pool.
#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_len: Option<usize>,
}

impl JobQueue {
    /// `max_len` bounds the number of waiting jobs; `None` means unbounded.
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_len,
        }
    }

    // A poisoned lock only means another thread panicked mid-operation; the
    // heap and token map are still structurally valid.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails with `QueueFull` when the optional bound is reached.
    pub fn ensure_capacity(&self, additional: usize) -> Result<(), EngineError> {
        if let Some(capacity) = self.max_len
            && self.lock().heap.len() + additional > capacity
        {
            return Err(EngineError::QueueFull { capacity });
        }
        Ok(())
    }

    pub fn enqueue(&self, job_id: &str, priority: i32) -> Result<QueueEntry, EngineError> {
        let entry = {
            let mut state = self.lock();
            if let Some(capacity) = self.max_len
                && state.heap.len() >= capacity
            {
                return Err(EngineError::QueueFull { capacity });
            }
            state.push(job_id, priority)
        };

        tracing::debug!(job_id = %job_id, priority, seq = entry.seq, "Job enqueued");
        self.notify.notify_one();
        Ok(entry)
    }

    /// Re-admits a job that was already accepted before a restart. The
    /// bound only applies to new admissions, so this never fails.
    pub fn restore(&self, job_id: &str, priority: i32) -> QueueEntry {
        let entry = self.lock().push(job_id, priority);
        tracing::debug!(job_id = %job_id, priority, seq = entry.seq, "Job restored");
        self.notify.notify_one();
        entry
    }

    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        self.lock().heap.pop()
    }

    /// Waits until a job is available.
    pub async fn dequeue(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.try_dequeue() {
                // Wake another waiter in case more work is queued.
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Takes a job out before any worker picked it up. Returns `false` if
    /// it is not waiting in the queue.
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        let before = state.heap.len();
        state.heap.retain(|e| e.job_id != job_id);
        let removed = state.heap.len() != before;
        if removed {
            state.tokens.remove(job_id);
        }
        removed
    }

    pub fn cancellation_token(&self, entry: &QueueEntry) -> Option<CancellationToken> {
        self.lock()
            .tokens
            .get(&entry.job_id)
            .filter(|(seq, _)| *seq == entry.seq)
            .map(|(_, token)| token.clone())
    }

    /// Raises the cancellation flag of an admitted job. Returns `false` when
    /// the job holds no token (never admitted, or already released).
    pub fn signal_cancel(&self, job_id: &str) -> bool {
        match self.lock().tokens.get(job_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the token of a finished admission. A newer admission of the
    /// same job keeps its own token.
    pub fn release(&self, entry: &QueueEntry) {
        let mut state = self.lock();
        if state
            .tokens
            .get(&entry.job_id)
            .is_some_and(|(seq, _)| *seq == entry.seq)
        {
            state.tokens.remove(&entry.job_id);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}
