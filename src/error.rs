use std::fmt::Display;
use thiserror::Error;

/// Errors returned to callers of the tracker.
///
/// Job outcomes never travel through this type; they are read back as data
/// through [`crate::TaskTracker::status`].
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl TrackerError {
    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound { task_id: task_id.into() }
    }
}

/// Errors a job body may raise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Raised by [`crate::JobContext::checkpoint`] once cancellation was requested.
    #[error("task canceled")]
    Canceled,

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(err: impl Display) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.to_string())
    }
}
