//! Storage row types and their conversion into domain types.

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use queue_core::{JobId, JobItem, PoolLease, PriorityBand, WorkerId, WorkerRecord};
use serde::{Deserialize, Serialize};
use surrealdb::RecordId;

use crate::DbError;

/// Internal record type for the `job` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRow {
    #[serde(default, skip_serializing)]
    pub id: Option<RecordId>,
    pub job_id: String,
    pub priority_band: u8,
    /// JSON text; the store never looks inside.
    pub payload: String,
    pub processor_key: String,
    pub status: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(with = "ts_milliseconds")]
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default, with = "ts_milliseconds_option")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option")]
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn from_item(job: &JobItem) -> Result<Self, DbError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        Ok(Self {
            id: None,
            job_id: job.id.to_string(),
            priority_band: job.priority_band.value(),
            payload,
            processor_key: job.processor_key.clone(),
            status: job.status.as_str().to_string(),
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            next_eligible_at: job.next_eligible_at,
            locked_by: job.locked_by.as_ref().map(|w| w.to_string()),
            locked_at: job.locked_at,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            dead_lettered_at: job.dead_lettered_at,
        })
    }
}

impl TryFrom<JobRow> for JobItem {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::parse(&row.job_id)
            .map_err(|e| DbError::Serialization(format!("job id {}: {}", row.job_id, e)))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| DbError::Serialization(format!("payload of {}: {}", row.job_id, e)))?;
        let status = row
            .status
            .parse()
            .map_err(|e: queue_core::QueueError| DbError::Serialization(e.to_string()))?;
        Ok(JobItem {
            id,
            priority_band: PriorityBand(row.priority_band),
            payload,
            processor_key: row.processor_key,
            status,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            next_eligible_at: row.next_eligible_at,
            locked_by: row.locked_by.map(WorkerId),
            locked_at: row.locked_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            dead_lettered_at: row.dead_lettered_at,
        })
    }
}

pub(crate) fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<JobItem>, DbError> {
    rows.into_iter().map(JobItem::try_from).collect()
}

/// Internal record type for the `worker` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerRow {
    #[serde(default, skip_serializing)]
    pub id: Option<RecordId>,
    pub worker_id: String,
    pub process_handle: String,
    pub status: String,
    #[serde(with = "ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub last_heartbeat_at: DateTime<Utc>,
    pub processed_count: u64,
    #[serde(default)]
    pub current_job_id: Option<String>,
    #[serde(default)]
    pub pool_owner: Option<String>,
}

impl From<&WorkerRecord> for WorkerRow {
    fn from(record: &WorkerRecord) -> Self {
        Self {
            id: None,
            worker_id: record.worker_id.to_string(),
            process_handle: record.process_handle.clone(),
            status: record.status.as_str().to_string(),
            started_at: record.started_at,
            last_heartbeat_at: record.last_heartbeat_at,
            processed_count: record.processed_count,
            current_job_id: record.current_job_id.map(|id| id.to_string()),
            pool_owner: record.pool_owner.clone(),
        }
    }
}

impl TryFrom<WorkerRow> for WorkerRecord {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: queue_core::QueueError| DbError::Serialization(e.to_string()))?;
        let current_job_id = row
            .current_job_id
            .as_deref()
            .map(JobId::parse)
            .transpose()
            .map_err(|e| DbError::Serialization(format!("current job of {}: {}", row.worker_id, e)))?;
        Ok(WorkerRecord {
            worker_id: WorkerId(row.worker_id),
            process_handle: row.process_handle,
            status,
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
            processed_count: row.processed_count,
            current_job_id,
            pool_owner: row.pool_owner,
        })
    }
}

/// Internal record type for `pool:main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PoolRow {
    #[serde(default, skip_serializing)]
    pub id: Option<RecordId>,
    pub owner: String,
    pub size: u32,
    #[serde(with = "ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub stop_requested: bool,
}

impl From<PoolRow> for PoolLease {
    fn from(row: PoolRow) -> Self {
        PoolLease {
            owner: row.owner,
            size: row.size,
            started_at: row.started_at,
            heartbeat_at: row.heartbeat_at,
            stop_requested: row.stop_requested,
        }
    }
}

/// Internal record type for `band_dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DispatchRow {
    pub band: u8,
    #[serde(with = "ts_milliseconds")]
    pub last_dispatch_at: DateTime<Utc>,
}

/// Row of `count() ... GROUP` queries.
#[derive(Debug, Deserialize)]
pub(crate) struct CountRow {
    pub count: i64,
}
