//! `QueueStore` backed by SurrealDB.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use queue_core::{
    ClaimFilter, Clock, JobFilter, JobId, JobItem, JobStatus, NewJob, PoolLease, PriorityBand,
    ProcessError, QueueError, QueueResult, QueueStore, RetryPolicy, StatusBandCount, SystemClock,
    WorkerFilter, WorkerId, WorkerRecord, WorkerStatus,
};

use crate::repositories::{ControlRepository, JobRepository, Release, WorkerRepository};
use crate::{Database, DbError};

/// Candidates fetched per claim round.
const CLAIM_BATCH: usize = 16;

/// Queue store over a SurrealDB connection.
///
/// Every state change is a single conditional `UPDATE`, so concurrent
/// workers in any number of processes never both win the same job.
#[derive(Clone)]
pub struct SurrealQueueStore {
    jobs: JobRepository,
    workers: WorkerRepository,
    control: ControlRepository,
    clock: Arc<dyn Clock>,
    bands: Vec<PriorityBand>,
}

impl SurrealQueueStore {
    /// Create a store with the wall clock and the four stock bands.
    pub fn new(db: Database) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            workers: WorkerRepository::new(db.clone()),
            control: ControlRepository::new(db),
            clock: Arc::new(SystemClock),
            bands: vec![
                PriorityBand::URGENT,
                PriorityBand::HIGH,
                PriorityBand::NORMAL,
                PriorityBand::LOW,
            ],
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Restrict enqueue to these bands.
    pub fn with_bands(mut self, bands: Vec<PriorityBand>) -> Self {
        self.bands = bands;
        self
    }

    /// Resolve a failed compare-and-set into the error the caller should see.
    async fn lock_conflict(&self, job_id: JobId, worker_id: &WorkerId) -> QueueError {
        match self.jobs.get(job_id).await {
            Ok(Some(_)) => QueueError::LockConflict {
                job_id,
                worker_id: worker_id.clone(),
            },
            Ok(None) => QueueError::NotFound(format!("Job not found: {}", job_id)),
            Err(e) => e.into(),
        }
    }

    /// End the attempt of every job in `jobs`, consuming one attempt each.
    async fn release_jobs(
        &self,
        jobs: Vec<JobItem>,
        reason: &str,
    ) -> QueueResult<Vec<JobItem>> {
        let now = self.clock.now();
        let mut released = Vec::with_capacity(jobs.len());

        for job in jobs {
            let Some(owner) = job.locked_by.clone() else {
                continue;
            };
            let release = if RetryPolicy::exhausted(job.attempt_count, job.max_attempts) {
                Release::DeadLetter
            } else {
                Release::Retry { at: now }
            };

            match self
                .jobs
                .release(job.id, &owner, job.attempt_count, release, reason, now)
                .await
            {
                Ok(Some(item)) => {
                    tracing::warn!(
                        job_id = %item.id,
                        owner = %owner,
                        status = %item.status,
                        "Released job: {}",
                        reason
                    );
                    released.push(item);
                }
                // The owner settled it in the meantime.
                Ok(None) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(released)
    }
}

#[async_trait]
impl QueueStore for SurrealQueueStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        job.validate(&self.bands)?;
        let item = job.into_item(self.clock.now());
        let created = self.jobs.create(&item).await?;
        tracing::debug!(
            job_id = %created.id,
            band = %created.priority_band,
            processor = %created.processor_key,
            "Enqueued job"
        );
        Ok(created.id)
    }

    async fn get(&self, job_id: JobId) -> QueueResult<JobItem> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("Job not found: {}", job_id)))
    }

    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        worker_id: &WorkerId,
    ) -> QueueResult<Option<JobItem>> {
        if filter.is_empty() {
            return Ok(None);
        }

        // Every lost race means another worker locked that candidate, so
        // each round either claims, sees an empty queue or sees progress.
        loop {
            let now = self.clock.now();
            let candidates = self.jobs.claim_candidates(filter, now, CLAIM_BATCH).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for job_id in candidates {
                match self
                    .jobs
                    .try_lock(job_id, &filter.statuses, worker_id, now)
                    .await
                {
                    Ok(Some(job)) => {
                        tracing::debug!(job_id = %job.id, worker_id = %worker_id, "Claimed job");
                        return Ok(Some(job));
                    }
                    Ok(None) => continue,
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(job_id = %job_id, "Lost claim race: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    async fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> QueueResult<JobItem> {
        let now = self.clock.now();
        match self.jobs.mark_completed(job_id, worker_id, now).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(self.lock_conflict(job_id, worker_id).await),
            Err(e) if e.is_conflict() => Err(self.lock_conflict(job_id, worker_id).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        failure: &ProcessError,
        policy: &RetryPolicy,
    ) -> QueueResult<JobItem> {
        let now = self.clock.now();
        let job = self.get(job_id).await?;
        if !job.is_locked_by(worker_id) {
            return Err(QueueError::LockConflict {
                job_id,
                worker_id: worker_id.clone(),
            });
        }

        let release = if failure.is_terminal() {
            Release::DeadLetter
        } else {
            let decision = policy.next(job.attempt_count, job.max_attempts, now);
            match decision.retry_at {
                Some(at) if !decision.terminal => Release::Retry { at },
                _ => Release::DeadLetter,
            }
        };

        match self
            .jobs
            .release(job_id, worker_id, job.attempt_count, release, failure.message(), now)
            .await
        {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(self.lock_conflict(job_id, worker_id).await),
            Err(e) if e.is_conflict() => Err(self.lock_conflict(job_id, worker_id).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn reclaim_stale(&self, lock_ttl: Duration) -> QueueResult<Vec<JobItem>> {
        let cutoff = self.clock.now() - lock_ttl;
        let stale = self.jobs.locked_before(cutoff).await?;
        if stale.is_empty() {
            return Ok(stale);
        }
        let reason = format!("lock expired after {}s", lock_ttl.num_seconds());
        self.release_jobs(stale, &reason).await
    }

    async fn release_worker(&self, worker_id: &WorkerId) -> QueueResult<Vec<JobItem>> {
        let held = self.jobs.locked_by(worker_id).await?;
        if held.is_empty() {
            return Ok(held);
        }
        let reason = format!("worker {} stopped while holding the lock", worker_id);
        self.release_jobs(held, &reason).await
    }

    async fn query_page(&self, filter: &JobFilter) -> QueueResult<Vec<JobItem>> {
        Ok(self.jobs.list(filter).await?)
    }

    async fn count_jobs(&self, filter: &JobFilter) -> QueueResult<u64> {
        Ok(self.jobs.count(filter).await?)
    }

    async fn count_by_status_band(&self) -> QueueResult<Vec<StatusBandCount>> {
        Ok(self.jobs.count_by_status_band().await?)
    }

    async fn oldest_created_at(&self, status: JobStatus) -> QueueResult<Option<DateTime<Utc>>> {
        Ok(self.jobs.oldest_created_at(status).await?)
    }

    async fn last_dispatch(&self, band: PriorityBand) -> QueueResult<Option<DateTime<Utc>>> {
        Ok(self.control.last_dispatch(band).await?)
    }

    async fn record_dispatch(&self, band: PriorityBand, at: DateTime<Utc>) -> QueueResult<()> {
        Ok(self.control.record_dispatch(band, at).await?)
    }

    async fn register_worker(&self, record: &WorkerRecord) -> QueueResult<()> {
        self.workers.create(record).await?;
        tracing::debug!(worker_id = %record.worker_id, "Registered worker");
        Ok(())
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        current_job: Option<JobId>,
        processed_count: u64,
    ) -> QueueResult<()> {
        let now = self.clock.now();
        self.workers
            .touch(worker_id, current_job, processed_count, now)
            .await?;
        Ok(())
    }

    async fn set_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> QueueResult<()> {
        self.workers.set_status(worker_id, status).await?;
        Ok(())
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> QueueResult<Option<WorkerRecord>> {
        Ok(self.workers.get(worker_id).await?)
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> QueueResult<Vec<WorkerRecord>> {
        Ok(self.workers.list(filter).await?)
    }

    async fn remove_worker(&self, worker_id: &WorkerId) -> QueueResult<()> {
        Ok(self.workers.delete(worker_id).await?)
    }

    async fn acquire_pool(
        &self,
        owner: &str,
        size: u32,
        stale_after: Duration,
    ) -> QueueResult<PoolLease> {
        let now = self.clock.now();
        let lease = PoolLease {
            owner: owner.to_string(),
            size,
            started_at: now,
            heartbeat_at: now,
            stop_requested: false,
        };

        let create_err = match self.control.create_pool(&lease).await {
            Ok(Some(created)) => return Ok(created),
            Ok(None) => None,
            // Most likely the record already exists.
            Err(e) => Some(e),
        };

        if let Some(taken) = self.control.take_over_pool(&lease, now - stale_after).await? {
            tracing::info!(owner = %owner, "Took over stale worker pool lease");
            return Ok(taken);
        }

        match self.control.pool().await? {
            Some(current) => Err(QueueError::PoolAlreadyRunning {
                owner: current.owner,
            }),
            None => Err(create_err
                .unwrap_or_else(|| DbError::Query("Failed to create pool lease".into()))
                .into()),
        }
    }

    async fn renew_pool(&self, owner: &str) -> QueueResult<PoolLease> {
        let now = self.clock.now();
        self.control
            .renew_pool(owner, now)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("Pool lease not held by {}", owner)))
    }

    async fn request_pool_stop(&self) -> QueueResult<bool> {
        Ok(self.control.request_stop().await?.is_some())
    }

    async fn release_pool(&self, owner: &str) -> QueueResult<()> {
        Ok(self.control.delete_pool(owner).await?)
    }

    async fn pool(&self) -> QueueResult<Option<PoolLease>> {
        Ok(self.control.pool().await?)
    }
}
