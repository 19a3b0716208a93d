//! Message types for actor communication.

use queue_core::{QueueError, WorkerId, WorkerRecord};
use ractor::RpcReplyPort;
use serde::Serialize;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run one cycle and schedule the next.
    Poll,

    /// Finish the current job, then stop.
    Drain,
}

/// Messages for the WorkerSupervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Take the pool lease and spawn workers.
    Start {
        workers: u32,
        reply: RpcReplyPort<Result<PoolStatus, QueueError>>,
    },

    /// Drain every worker and release the lease.
    Stop {
        reply: RpcReplyPort<Result<(), QueueError>>,
    },

    /// Report the pool.
    Status {
        reply: RpcReplyPort<Result<PoolStatus, QueueError>>,
    },

    /// Run the health checks now.
    CheckHealth { reply: RpcReplyPort<HealthReport> },

    /// Periodic tick for health checks.
    Tick,
}

/// Snapshot of a supervised pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub owner: String,
    pub running: bool,
    pub target_size: u32,
    /// Worker actors currently alive in this process.
    pub live_workers: usize,
    pub workers: Vec<WorkerRecord>,
    pub processed_total: u64,
}

/// What one health pass found and fixed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Jobs whose locks expired.
    pub reclaimed: usize,
    /// Workers whose heartbeat went stale.
    pub crashed: Vec<WorkerId>,
    /// Workers spawned to restore the pool size.
    pub replaced: usize,
    pub stop_requested: bool,
}

/// Result type for supervisor calls.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),
}
