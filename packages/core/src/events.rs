//! Event types emitted by workers and supervisors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, PriorityBand, WorkerId};

/// Events emitted by the engine for live observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A worker locked a job.
    JobClaimed {
        job_id: JobId,
        band: PriorityBand,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        worker_id: WorkerId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A transient failure scheduled another attempt.
    JobRetryScheduled {
        job_id: JobId,
        error: String,
        attempt_count: u32,
        retry_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    /// A job reached the dead-letter state.
    JobDeadLettered {
        job_id: JobId,
        error: String,
        attempt_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A stale or orphaned lock was returned to the queue.
    JobReclaimed {
        job_id: JobId,
        previous_owner: Option<WorkerId>,
        timestamp: DateTime<Utc>,
    },
    /// A worker tried to settle a job it no longer owns.
    LockConflict {
        job_id: JobId,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    WorkerStarted {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    WorkerStopped {
        worker_id: WorkerId,
        processed_count: u64,
        timestamp: DateTime<Utc>,
    },
    WorkerCrashed {
        worker_id: WorkerId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobClaimed { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobRetryScheduled { timestamp, .. } => *timestamp,
            JobEvent::JobDeadLettered { timestamp, .. } => *timestamp,
            JobEvent::JobReclaimed { timestamp, .. } => *timestamp,
            JobEvent::LockConflict { timestamp, .. } => *timestamp,
            JobEvent::WorkerStarted { timestamp, .. } => *timestamp,
            JobEvent::WorkerStopped { timestamp, .. } => *timestamp,
            JobEvent::WorkerCrashed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobClaimed { job_id, .. } => Some(*job_id),
            JobEvent::JobCompleted { job_id, .. } => Some(*job_id),
            JobEvent::JobRetryScheduled { job_id, .. } => Some(*job_id),
            JobEvent::JobDeadLettered { job_id, .. } => Some(*job_id),
            JobEvent::JobReclaimed { job_id, .. } => Some(*job_id),
            JobEvent::LockConflict { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get the worker ID associated with this event, if any.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            JobEvent::JobClaimed { worker_id, .. }
            | JobEvent::JobCompleted { worker_id, .. }
            | JobEvent::LockConflict { worker_id, .. }
            | JobEvent::WorkerStarted { worker_id, .. }
            | JobEvent::WorkerStopped { worker_id, .. }
            | JobEvent::WorkerCrashed { worker_id, .. } => Some(worker_id),
            JobEvent::JobReclaimed { previous_owner, .. } => previous_owner.as_ref(),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobClaimed {
                job_id,
                band,
                worker_id,
                ..
            } => format!("Job {} (band {}) claimed by {}", job_id, band, worker_id),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobRetryScheduled {
                job_id,
                error,
                retry_at,
                ..
            } => format!("Job {} failed: {} (retry at {})", job_id, error, retry_at),
            JobEvent::JobDeadLettered {
                job_id,
                error,
                attempt_count,
                ..
            } => format!(
                "Job {} dead-lettered after {} attempts: {}",
                job_id, attempt_count, error
            ),
            JobEvent::JobReclaimed { job_id, .. } => format!("Job {} reclaimed", job_id),
            JobEvent::LockConflict {
                job_id, worker_id, ..
            } => format!("Job {} no longer locked by {}", job_id, worker_id),
            JobEvent::WorkerStarted { worker_id, .. } => format!("Worker {} started", worker_id),
            JobEvent::WorkerStopped {
                worker_id,
                processed_count,
                ..
            } => format!(
                "Worker {} stopped after {} jobs",
                worker_id, processed_count
            ),
            JobEvent::WorkerCrashed {
                worker_id, reason, ..
            } => format!("Worker {} crashed: {}", worker_id, reason),
        }
    }
}
