//! Worker and pool records shared between workers, supervisors and the CLI.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::QueueError;
use crate::job::JobId;

/// Identifier of a worker, unique across processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Create a fresh worker ID.
    pub fn new() -> Self {
        Self(format!("worker-{}", Ulid::new().to_string().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a worker as seen by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Running,
    Draining,
    Stopped,
    Crashed,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 5] = [
        WorkerStatus::Starting,
        WorkerStatus::Running,
        WorkerStatus::Draining,
        WorkerStatus::Stopped,
        WorkerStatus::Crashed,
    ];

    /// A live worker is expected to keep heartbeating.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Draining
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::Validation(format!("Unknown worker status: {s}")))
    }
}

/// Persisted view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// OS process id plus in-process actor name.
    pub process_handle: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub processed_count: u64,
    pub current_job_id: Option<JobId>,
    /// Supervisor that started this worker; `None` for one-shot runs.
    pub pool_owner: Option<String>,
}

impl WorkerRecord {
    /// Create a record in the `starting` state.
    pub fn new(worker_id: WorkerId, process_handle: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            process_handle: process_handle.into(),
            status: WorkerStatus::Starting,
            started_at: now,
            last_heartbeat_at: now,
            processed_count: 0,
            current_job_id: None,
            pool_owner: None,
        }
    }

    /// Mark the record as belonging to a supervised pool.
    pub fn with_pool_owner(mut self, owner: impl Into<String>) -> Self {
        self.pool_owner = Some(owner.into());
        self
    }

    /// A live worker whose heartbeat is older than `ttl`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status.is_live() && self.last_heartbeat_at < now - ttl
    }
}

/// Handle string for a worker living in this OS process.
pub fn process_handle(actor_name: &str) -> String {
    format!("pid:{}/{}", std::process::id(), actor_name)
}

/// Store-held record of the running worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolLease {
    pub owner: String,
    pub size: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub stop_requested: bool,
}

impl PoolLease {
    /// The owning supervisor stopped renewing the lease.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.heartbeat_at < now - stale_after
    }
}
