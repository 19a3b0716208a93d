//! Job repository: claim, settle and read queries for the `job` table.

use chrono::{DateTime, Utc};
use queue_core::{
    ClaimFilter, ClaimOrder, JobFilter, JobId, JobItem, JobStatus, PriorityBand, StatusBandCount,
    WorkerId,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Bindings, fetch};
use crate::records::{CountRow, JobRow, into_jobs};
use crate::{Database, DbError};

/// State a locked job moves to when its current attempt ends without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Back to `retry_pending`, claimable again at the given instant.
    Retry { at: DateTime<Utc> },
    DeadLetter,
}

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new job in the database.
    pub async fn create(&self, job: &JobItem) -> Result<JobItem, DbError> {
        let row = JobRow::from_item(job)?;

        let record: Option<JobRow> = self
            .db
            .create(("job", job.id.to_string()))
            .content(row)
            .await?;

        record
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .try_into()
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Option<JobItem>, DbError> {
        let record: Option<JobRow> = self.db.select(("job", id.to_string())).await?;
        record.map(JobItem::try_from).transpose()
    }

    /// Ids of eligible jobs in claim order.
    pub async fn claim_candidates(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, DbError> {
        let order = match filter.order {
            ClaimOrder::BandFirst => "priority_band ASC, created_at ASC, job_id ASC",
            ClaimOrder::DueFirst => "next_eligible_at ASC, created_at ASC, job_id ASC",
        };
        let query = format!(
            r#"
            SELECT job_id, priority_band, created_at, next_eligible_at FROM job
            WHERE status IN $statuses AND next_eligible_at <= $now AND priority_band IN $bands
            ORDER BY {order}
            LIMIT $limit
            "#
        );

        #[derive(Deserialize)]
        struct Candidate {
            job_id: String,
        }

        let bindings: Bindings = vec![
            ("statuses", status_list(&filter.statuses)),
            ("bands", band_list(&filter.bands)),
            ("now", json!(now.timestamp_millis())),
            ("limit", json!(limit as i64)),
        ];
        let candidates: Vec<Candidate> = fetch(&self.db, query, bindings).await?;

        candidates
            .into_iter()
            .map(|c| {
                JobId::parse(&c.job_id)
                    .map_err(|e| DbError::Serialization(format!("job id {}: {}", c.job_id, e)))
            })
            .collect()
    }

    /// Lock one job if it is still eligible. `None` means another worker got there first.
    pub async fn try_lock(
        &self,
        id: JobId,
        statuses: &[JobStatus],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobItem>, DbError> {
        let query = r#"
            UPDATE type::thing('job', $id)
            SET status = 'locked', locked_by = $worker, locked_at = $now, updated_at = $now
            WHERE status IN $statuses AND next_eligible_at <= $now
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("id", json!(id.to_string())),
            ("worker", json!(worker_id.as_str())),
            ("statuses", status_list(statuses)),
            ("now", json!(now.timestamp_millis())),
        ];
        first_job(fetch(&self.db, query.to_string(), bindings).await?)
    }

    /// Complete a job held by `worker_id`. `None` when the caller does not hold the lock.
    pub async fn mark_completed(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobItem>, DbError> {
        let query = r#"
            UPDATE type::thing('job', $id)
            SET status = 'completed', attempt_count += 1, locked_by = NONE, locked_at = NONE,
                completed_at = $now, updated_at = $now
            WHERE status = 'locked' AND locked_by = $worker
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("id", json!(id.to_string())),
            ("worker", json!(worker_id.as_str())),
            ("now", json!(now.timestamp_millis())),
        ];
        first_job(fetch(&self.db, query.to_string(), bindings).await?)
    }

    /// End the current attempt of a job locked by `owner`, consuming one attempt.
    ///
    /// `seen_attempts` guards against settling an attempt that has already been settled.
    pub async fn release(
        &self,
        id: JobId,
        owner: &WorkerId,
        seen_attempts: u32,
        release: Release,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobItem>, DbError> {
        let mut bindings: Bindings = vec![
            ("id", json!(id.to_string())),
            ("worker", json!(owner.as_str())),
            ("seen", json!(seen_attempts)),
            ("attempts", json!(seen_attempts.saturating_add(1))),
            ("error", json!(error)),
            ("now", json!(now.timestamp_millis())),
        ];
        let assignments = match release {
            Release::Retry { at } => {
                bindings.push(("at", json!(at.timestamp_millis())));
                "status = 'retry_pending', next_eligible_at = $at"
            }
            Release::DeadLetter => "status = 'dead_letter', dead_lettered_at = $now",
        };
        let query = format!(
            r#"
            UPDATE type::thing('job', $id)
            SET {assignments}, attempt_count = $attempts, last_error = $error,
                locked_by = NONE, locked_at = NONE, updated_at = $now
            WHERE status = 'locked' AND locked_by = $worker AND attempt_count = $seen
            RETURN AFTER
            "#
        );
        first_job(fetch(&self.db, query, bindings).await?)
    }

    /// Jobs whose lock was taken before `cutoff`.
    pub async fn locked_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobItem>, DbError> {
        let query = r#"
            SELECT * FROM job
            WHERE status = 'locked' AND locked_at < $cutoff
            ORDER BY locked_at ASC
        "#;
        let bindings: Bindings = vec![("cutoff", json!(cutoff.timestamp_millis()))];
        into_jobs(fetch(&self.db, query.to_string(), bindings).await?)
    }

    /// Jobs currently locked by one worker.
    pub async fn locked_by(&self, worker_id: &WorkerId) -> Result<Vec<JobItem>, DbError> {
        let query = r#"
            SELECT * FROM job
            WHERE status = 'locked' AND locked_by = $worker
        "#;
        let bindings: Bindings = vec![("worker", json!(worker_id.as_str()))];
        into_jobs(fetch(&self.db, query.to_string(), bindings).await?)
    }

    /// List jobs with optional filtering, in id order.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobItem>, DbError> {
        let (where_clause, mut bindings) = filter_clause(filter);

        let limit_clause = match filter.limit {
            Some(limit) => {
                bindings.push(("limit", json!(limit as i64)));
                "LIMIT $limit"
            }
            None => "",
        };
        let offset_clause = match filter.offset {
            Some(offset) => {
                bindings.push(("offset", json!(offset as i64)));
                "START $offset"
            }
            None => "",
        };

        let query = format!(
            "SELECT * FROM job {} ORDER BY job_id ASC {} {}",
            where_clause, limit_clause, offset_clause
        );
        into_jobs(fetch(&self.db, query, bindings).await?)
    }

    /// Count jobs matching the filter, ignoring limit and offset.
    pub async fn count(&self, filter: &JobFilter) -> Result<u64, DbError> {
        let (where_clause, bindings) = filter_clause(filter);
        let query = format!("SELECT count() AS count FROM job {} GROUP ALL", where_clause);
        let rows: Vec<CountRow> = fetch(&self.db, query, bindings).await?;
        Ok(rows.first().map(|r| r.count.max(0) as u64).unwrap_or(0))
    }

    /// Count jobs by status and band.
    pub async fn count_by_status_band(&self) -> Result<Vec<StatusBandCount>, DbError> {
        let query = r#"
            SELECT status, priority_band, count() AS count
            FROM job
            GROUP BY status, priority_band
        "#;

        #[derive(Deserialize)]
        struct StatusBandRow {
            status: String,
            priority_band: u8,
            count: i64,
        }

        let rows: Vec<StatusBandRow> = fetch(&self.db, query.to_string(), Vec::new()).await?;

        rows.into_iter()
            .map(|row| {
                let status = row
                    .status
                    .parse()
                    .map_err(|e: queue_core::QueueError| DbError::Serialization(e.to_string()))?;
                Ok(StatusBandCount {
                    status,
                    band: PriorityBand(row.priority_band),
                    count: row.count.max(0) as u64,
                })
            })
            .collect()
    }

    /// Creation time of the oldest job in a status.
    pub async fn oldest_created_at(
        &self,
        status: JobStatus,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let query = r#"
            SELECT created_at FROM job
            WHERE status = $status
            ORDER BY created_at ASC
            LIMIT 1
        "#;

        #[derive(Deserialize)]
        struct CreatedRow {
            #[serde(with = "chrono::serde::ts_milliseconds")]
            created_at: DateTime<Utc>,
        }

        let bindings: Bindings = vec![("status", json!(status.as_str()))];
        let rows: Vec<CreatedRow> = fetch(&self.db, query.to_string(), bindings).await?;
        Ok(rows.first().map(|r| r.created_at))
    }
}

fn first_job(rows: Vec<JobRow>) -> Result<Option<JobItem>, DbError> {
    rows.into_iter().next().map(JobItem::try_from).transpose()
}

fn status_list(statuses: &[JobStatus]) -> Value {
    json!(statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>())
}

fn band_list(bands: &[PriorityBand]) -> Value {
    json!(bands.iter().map(|b| b.value()).collect::<Vec<_>>())
}

/// Build the WHERE clause shared by listing and counting.
fn filter_clause(filter: &JobFilter) -> (String, Bindings) {
    let mut conditions = Vec::new();
    let mut bindings: Bindings = Vec::new();

    if let Some(status) = &filter.status {
        conditions.push("status = $status");
        bindings.push(("status", json!(status.as_str())));
    }

    if let Some(band) = &filter.band {
        conditions.push("priority_band = $band");
        bindings.push(("band", json!(band.value())));
    }

    if let Some(key) = &filter.processor_key {
        conditions.push("processor_key = $processor_key");
        bindings.push(("processor_key", json!(key)));
    }

    if let Some(worker) = &filter.locked_by {
        conditions.push("locked_by = $locked_by");
        bindings.push(("locked_by", json!(worker.as_str())));
    }

    if let Some(before) = &filter.created_before {
        conditions.push("created_at <= $created_before");
        bindings.push(("created_before", json!(before.timestamp_millis())));
    }

    if let Some(after) = &filter.completed_after {
        conditions.push("completed_at >= $completed_after");
        bindings.push(("completed_after", json!(after.timestamp_millis())));
    }

    if let Some(after_id) = &filter.after_id {
        conditions.push("job_id > $after_id");
        bindings.push(("after_id", json!(after_id.to_string())));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    (where_clause, bindings)
}
