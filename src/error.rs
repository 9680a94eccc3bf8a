use thiserror::Error;

use crate::state_machine::JobStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid template `{template_id}`: {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Step `{step_id}` timed out after {timeout_ms}ms")]
    DispatchTimeout { step_id: String, timeout_ms: u64 },

    #[error("Step `{step_id}` failed: {message}")]
    DispatchFailure { step_id: String, message: String },

    #[error("Retries exhausted for job {job_id} ({retry_count}/{max_retries})")]
    RetriesExhausted {
        job_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    /// Errors caused by the caller's request. These are returned as-is and
    /// never retried by the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::TemplateNotFound(_)
                | EngineError::InvalidParams(_)
                | EngineError::InvalidState { .. }
                | EngineError::JobNotFound(_)
                | EngineError::RetriesExhausted { .. }
                | EngineError::AdmissionRejected(_)
                | EngineError::QueueFull { .. }
        )
    }

    /// Execution-time failures handled by a step's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DispatchTimeout { .. } | EngineError::DispatchFailure { .. }
        )
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        EngineError::StorageFailure(err.to_string())
    }
}
