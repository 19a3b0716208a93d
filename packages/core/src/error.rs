//! Error types shared by every queue component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;
use crate::worker::WorkerId;

/// Errors surfaced by the queue store and its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Rejected before anything was persisted.
    #[error("Validation error: {0}")]
    Validation(String),
    /// The caller does not hold the lock on the job.
    #[error("Job {job_id} is not locked by worker {worker_id}")]
    LockConflict { job_id: JobId, worker_id: WorkerId },
    #[error("Not found: {0}")]
    NotFound(String),
    /// The store could not be reached or the query failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Worker pool already running (owner {owner})")]
    PoolAlreadyRunning { owner: String },
}

impl QueueError {
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, QueueError::LockConflict { .. })
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Outcome of a processor that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ProcessError {
    /// Worth retrying under the retry policy.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help; the job goes straight to the dead-letter state.
    #[error("{0}")]
    Terminal(String),
}

impl ProcessError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessError::Terminal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProcessError::Transient(message) | ProcessError::Terminal(message) => message,
        }
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self::Transient(message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self::Transient(message.to_string())
    }
}
