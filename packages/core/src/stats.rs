//! Aggregate queue statistics shared by the CLI and the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::PriorityBand;
use crate::worker::WorkerStatus;

/// Pending depth for one band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandDepth {
    pub band: PriorityBand,
    pub name: String,
    pub pending: u64,
    pub retry_pending: u64,
}

/// Worker counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub starting: u64,
    pub running: u64,
    pub draining: u64,
    pub stopped: u64,
    pub crashed: u64,
}

impl WorkerCounts {
    pub fn add(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Starting => self.starting += 1,
            WorkerStatus::Running => self.running += 1,
            WorkerStatus::Draining => self.draining += 1,
            WorkerStatus::Stopped => self.stopped += 1,
            WorkerStatus::Crashed => self.crashed += 1,
        }
    }

    pub fn live(&self) -> u64 {
        self.starting + self.running + self.draining
    }
}

/// Point-in-time view of queue health. Eventually consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub bands: Vec<BandDepth>,
    pub pending: u64,
    pub locked: u64,
    pub retry_pending: u64,
    pub dead_letter: u64,
    pub completed: u64,
    /// Completed since UTC midnight.
    pub completed_today: u64,
    pub oldest_pending_age_secs: Option<i64>,
    /// Completions per minute over the throughput window.
    pub throughput_per_min: f64,
    pub throughput_window_secs: u64,
    pub workers: WorkerCounts,
}

impl StatsSnapshot {
    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letter
    }
}
