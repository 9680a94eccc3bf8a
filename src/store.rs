//! Durable job records.
//!
//! The engine only needs whole-record reads and writes keyed by job id.
//! [`MemoryJobStore`] backs tests and the demo; [`FileJobStore`] keeps one
//! JSON document per job so runs survive a restart.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::EngineError;
use crate::state_machine::{Job, JobStatus};

/// Selects jobs by status, template and batch. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub template_id: Option<String>,
    pub batch_id: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self
                .template_id
                .as_deref()
                .is_none_or(|t| t == job.template_id)
            && self
                .batch_id
                .as_deref()
                .is_none_or(|b| job.batch_id.as_deref() == Some(b))
    }
}

/// Persistence contract for jobs.
///
/// `update` replaces the whole record. Writers are serialized per job by the
/// engine (one worker per job), so implementations only need to make each
/// call atomic.
pub trait JobStore: Send + Sync {
    fn create(&self, job: &Job) -> Result<(), EngineError>;

    fn get(&self, job_id: &str) -> Result<Job, EngineError>;

    fn update(&self, job: &Job) -> Result<(), EngineError>;

    /// Matching jobs, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError>;

    /// Returns whether a record was removed.
    fn delete(&self, job_id: &str) -> Result<bool, EngineError>;
}

fn newest_first(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Job>>, EngineError> {
        self.jobs.read().map_err(EngineError::storage)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Job>>, EngineError> {
        self.jobs.write().map_err(EngineError::storage)
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: &Job) -> Result<(), EngineError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(EngineError::StorageFailure(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        self.read()?
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    fn update(&self, job: &Job) -> Result<(), EngineError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(EngineError::JobNotFound(job.id.clone())),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        let jobs = self
            .read()?
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        Ok(newest_first(jobs))
    }

    fn delete(&self, job_id: &str) -> Result<bool, EngineError> {
        Ok(self.write()?.remove(job_id).is_some())
    }
}

/// One `<job id>.json` file per job inside a directory.
///
/// Records are written to a temporary file and renamed into place, so a
/// reader never sees a half-written job.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Opens (and creates if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(EngineError::storage)?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, EngineError> {
        let valid = !job_id.is_empty()
            && job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }

    fn write_record(&self, path: &Path, job: &Job) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(job).map_err(EngineError::storage)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(EngineError::storage)?;
        fs::rename(&tmp, path).map_err(EngineError::storage)
    }

    fn read_record(path: &Path) -> Result<Job, EngineError> {
        let bytes = fs::read(path).map_err(EngineError::storage)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::StorageFailure(format!("corrupt record {}: {e}", path.display()))
        })
    }
}

impl JobStore for FileJobStore {
    fn create(&self, job: &Job) -> Result<(), EngineError> {
        let path = self.path_for(&job.id)?;
        if path.exists() {
            return Err(EngineError::StorageFailure(format!(
                "job {} already exists",
                job.id
            )));
        }
        self.write_record(&path, job)
    }

    fn get(&self, job_id: &str) -> Result<Job, EngineError> {
        let path = self.path_for(job_id)?;
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::StorageFailure(format!("corrupt record {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(EngineError::JobNotFound(job_id.to_string()))
            }
            Err(e) => Err(EngineError::storage(e)),
        }
    }

    fn update(&self, job: &Job) -> Result<(), EngineError> {
        let path = self.path_for(&job.id)?;
        if !path.exists() {
            return Err(EngineError::JobNotFound(job.id.clone()));
        }
        self.write_record(&path, job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(EngineError::storage)? {
            let path = entry.map_err(EngineError::storage)?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let job = Self::read_record(&path)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(newest_first(jobs))
    }

    fn delete(&self, job_id: &str) -> Result<bool, EngineError> {
        let path = self.path_for(job_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::storage(e)),
        }
    }
}
