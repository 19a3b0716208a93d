//! Worker record repository.

use chrono::{DateTime, Utc};
use queue_core::{JobId, WorkerFilter, WorkerId, WorkerRecord, WorkerStatus};
use serde_json::json;

use super::{Bindings, fetch};
use crate::records::WorkerRow;
use crate::{Database, DbError};

/// Repository for worker record persistence.
#[derive(Clone)]
pub struct WorkerRepository {
    db: Database,
}

impl WorkerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new worker record.
    pub async fn create(&self, record: &WorkerRecord) -> Result<WorkerRecord, DbError> {
        let row = WorkerRow::from(record);
        let created: Option<WorkerRow> = self
            .db
            .create(("worker", record.worker_id.to_string()))
            .content(row)
            .await?;

        created
            .ok_or_else(|| DbError::Query("Failed to create worker".into()))?
            .try_into()
    }

    /// Refresh the heartbeat and progress fields.
    pub async fn touch(
        &self,
        worker_id: &WorkerId,
        current_job: Option<JobId>,
        processed_count: u64,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, DbError> {
        let query = r#"
            UPDATE type::thing('worker', $id)
            SET last_heartbeat_at = $now, current_job_id = $job, processed_count = $count
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("id", json!(worker_id.as_str())),
            ("now", json!(now.timestamp_millis())),
            ("job", json!(current_job.map(|id| id.to_string()))),
            ("count", json!(processed_count)),
        ];
        self.single(query, bindings, worker_id).await
    }

    pub async fn set_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<WorkerRecord, DbError> {
        let query = r#"
            UPDATE type::thing('worker', $id)
            SET status = $status
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("id", json!(worker_id.as_str())),
            ("status", json!(status.as_str())),
        ];
        self.single(query, bindings, worker_id).await
    }

    pub async fn get(&self, worker_id: &WorkerId) -> Result<Option<WorkerRecord>, DbError> {
        let record: Option<WorkerRow> = self.db.select(("worker", worker_id.to_string())).await?;
        record.map(WorkerRecord::try_from).transpose()
    }

    /// List worker records, oldest first.
    pub async fn list(&self, filter: &WorkerFilter) -> Result<Vec<WorkerRecord>, DbError> {
        let mut conditions = Vec::new();
        let mut bindings: Bindings = Vec::new();

        if let Some(status) = &filter.status {
            conditions.push("status = $status");
            bindings.push(("status", json!(status.as_str())));
        }

        if let Some(owner) = &filter.pool_owner {
            conditions.push("pool_owner = $owner");
            bindings.push(("owner", json!(owner)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {}", o))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM worker {} ORDER BY started_at ASC, worker_id ASC {} {}",
            where_clause, limit_clause, offset_clause
        );

        let rows: Vec<WorkerRow> = fetch(&self.db, query, bindings).await?;
        rows.into_iter().map(WorkerRecord::try_from).collect()
    }

    /// Delete a worker record.
    pub async fn delete(&self, worker_id: &WorkerId) -> Result<(), DbError> {
        let _: Option<WorkerRow> = self.db.delete(("worker", worker_id.to_string())).await?;
        Ok(())
    }

    async fn single(
        &self,
        query: &str,
        bindings: Bindings,
        worker_id: &WorkerId,
    ) -> Result<WorkerRecord, DbError> {
        let rows: Vec<WorkerRow> = fetch(&self.db, query.to_string(), bindings).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("Worker not found: {}", worker_id)))?
            .try_into()
    }
}
