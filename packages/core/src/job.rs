//! Job domain types for work items in the queue.

use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::{Generator, Ulid};

use crate::error::QueueError;
use crate::worker::WorkerId;

/// Process-wide generator so ids minted in the same millisecond stay ordered.
static ID_GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID, monotonic within this process.
    pub fn new() -> Self {
        let next = ID_GENERATOR
            .lock()
            .ok()
            .and_then(|mut generator| generator.generate().ok());
        Self(next.unwrap_or_else(Ulid::new))
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered priority band. Lower numbers are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityBand(pub u8);

impl PriorityBand {
    pub const URGENT: Self = Self(1);
    pub const HIGH: Self = Self(2);
    pub const NORMAL: Self = Self(3);
    pub const LOW: Self = Self(4);

    pub fn value(self) -> u8 {
        self.0
    }

    /// Conventional name of the four stock bands.
    pub fn default_name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("urgent"),
            2 => Some("high"),
            3 => Some("normal"),
            4 => Some("low"),
            _ => None,
        }
    }
}

impl Default for PriorityBand {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl std::fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PriorityBand {
    type Err = QueueError;

    /// Accepts a band number (`"2"`) or a stock band name (`"high"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Ok(Self(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::URGENT),
            "high" => Ok(Self::HIGH),
            "normal" => Ok(Self::NORMAL),
            "low" => Ok(Self::LOW),
            _ => Err(QueueError::Validation(format!("Unknown priority band: {s}"))),
        }
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first execution.
    #[default]
    Pending,
    /// Owned by exactly one worker.
    Locked,
    /// Failed transiently, waiting for `next_eligible_at`.
    RetryPending,
    /// Finished successfully.
    Completed,
    /// Gave up permanently.
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Locked,
        JobStatus::RetryPending,
        JobStatus::Completed,
        JobStatus::DeadLetter,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    /// Check if a worker may claim a job in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::RetryPending)
    }

    /// Get a simple status string for display and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Locked => "locked",
            JobStatus::RetryPending => "retry_pending",
            JobStatus::Completed => "completed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::Validation(format!("Unknown job status: {s}")))
    }
}

/// A unit of work tracked by the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub id: JobId,
    pub priority_band: PriorityBand,
    /// Opaque payload handed to the processor.
    pub payload: serde_json::Value,
    /// Selects the processor that consumes the payload.
    pub processor_key: String,
    pub status: JobStatus,
    /// Finished execution attempts so far.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant.
    pub next_eligible_at: DateTime<Utc>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl JobItem {
    /// Check whether `worker_id` currently owns the lock.
    pub fn is_locked_by(&self, worker_id: &WorkerId) -> bool {
        self.status == JobStatus::Locked && self.locked_by.as_ref() == Some(worker_id)
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Producer-side request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub processor_key: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority_band: PriorityBand,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    NewJob::DEFAULT_MAX_ATTEMPTS
}

impl NewJob {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Create a normal-band job with the default attempt budget.
    pub fn new(processor_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            processor_key: processor_key.into(),
            payload,
            priority_band: PriorityBand::default(),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the priority band for this job.
    pub fn with_band(mut self, band: PriorityBand) -> Self {
        self.priority_band = band;
        self
    }

    /// Set the attempt budget for this job.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Reject the request before anything is persisted.
    pub fn validate(&self, bands: &[PriorityBand]) -> Result<(), QueueError> {
        if self.processor_key.trim().is_empty() {
            return Err(QueueError::Validation("processor_key must not be empty".into()));
        }
        if self.max_attempts < 1 {
            return Err(QueueError::Validation("max_attempts must be at least 1".into()));
        }
        if !bands.contains(&self.priority_band) {
            return Err(QueueError::Validation(format!(
                "priority band {} is not configured",
                self.priority_band
            )));
        }
        Ok(())
    }

    /// Build the pending record for this request.
    pub fn into_item(self, now: DateTime<Utc>) -> JobItem {
        JobItem {
            id: JobId::new(),
            priority_band: self.priority_band,
            payload: self.payload,
            processor_key: self.processor_key,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            next_eligible_at: now,
            locked_by: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            dead_lettered_at: None,
        }
    }
}
