//! Execution engine for the job queue.
//!
//! This crate runs jobs out of a [`QueueStore`](queue_core::QueueStore):
//!
//! # Architecture
//!
//! - `PriorityScheduler` - Turns a scheduling mode into claim filters
//! - `Worker` - One claim, execute and settle cycle at a time
//! - `WorkerActor` - Drives a `Worker` from its mailbox inside a pool
//! - `WorkerSupervisor` - Owns the pool and replaces crashed workers
//! - `StaleRecovery` - Reclaims expired locks and retires silent workers
//! - `StatsAggregator` - Read-only queue statistics
//!
//! # Usage
//!
//! ```ignore
//! use actors::{SchedulingMode, start_supervisor};
//!
//! let supervisor = start_supervisor("daemon", store, processors, config, SchedulingMode::Cascading).await?;
//! supervisor.start(4).await?;
//! ```

mod messages;
mod processor;
mod recovery;
mod scheduler;
mod stats;
mod supervisor;
mod worker;
mod worker_actor;

pub use messages::{
    ActorError, ActorResult, HealthReport, PoolStatus, SupervisorMessage, WorkerMessage,
};
pub use processor::{FnProcessor, ProcessFuture, ProcessResult, Processor, ProcessorRegistry};
pub use recovery::{RecoveryReport, StaleRecovery};
pub use scheduler::{PriorityScheduler, SchedulingMode};
pub use stats::StatsAggregator;
pub use supervisor::{SupervisorHandle, WorkerSupervisor, start_supervisor};
pub use worker::{CycleOutcome, RunBudget, RunReport, Worker, WorkerState};
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
