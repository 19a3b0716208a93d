//! Core domain types for the priority job queue.
//!
//! This crate contains shared types used across all packages:
//! - JobItem, JobStatus and PriorityBand for work items
//! - WorkerRecord and PoolLease for worker bookkeeping
//! - The `QueueStore` persistence contract and the lazy `JobQuery`
//! - RetryPolicy, engine configuration, events and stats snapshots

mod clock;
mod config;
mod error;
mod events;
mod job;
mod retry;
mod stats;
mod store;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BandConfig, EngineConfig, EnqueueConfig, SchedulerConfig, StatsConfig, SupervisorConfig,
    WorkerConfig,
};
pub use error::{ProcessError, QueueError, QueueResult};
pub use events::JobEvent;
pub use job::{JobId, JobItem, JobStatus, NewJob, PriorityBand};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use stats::{BandDepth, StatsSnapshot, WorkerCounts};
pub use store::{
    ClaimFilter, ClaimOrder, JobFilter, JobQuery, QueueStore, StatusBandCount, WorkerFilter,
};
pub use worker::{PoolLease, WorkerId, WorkerRecord, WorkerStatus, process_handle};
