//! The persistence contract every component above the store talks to.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use crate::error::{ProcessError, QueueResult};
use crate::job::{JobId, JobItem, JobStatus, NewJob, PriorityBand};
use crate::retry::RetryPolicy;
use crate::worker::{PoolLease, WorkerId, WorkerRecord, WorkerStatus};

/// How claim candidates are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimOrder {
    /// Lower band first, then FIFO inside the band.
    #[default]
    BandFirst,
    /// Oldest `next_eligible_at` first, ignoring bands.
    DueFirst,
}

/// What a worker is allowed to claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    pub statuses: Vec<JobStatus>,
    pub bands: Vec<PriorityBand>,
    pub order: ClaimOrder,
}

impl ClaimFilter {
    /// Pending and retry-pending jobs in `bands`.
    pub fn new(bands: Vec<PriorityBand>) -> Self {
        Self {
            statuses: vec![JobStatus::Pending, JobStatus::RetryPending],
            bands,
            order: ClaimOrder::BandFirst,
        }
    }

    /// Only jobs waiting for a retry.
    pub fn retries(bands: Vec<PriorityBand>, order: ClaimOrder) -> Self {
        Self {
            statuses: vec![JobStatus::RetryPending],
            bands,
            order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty() || self.bands.is_empty()
    }
}

/// Read-side filter used by listings, counts and the lazy query.
///
/// Listings are ordered by job id, which follows creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub band: Option<PriorityBand>,
    pub processor_key: Option<String>,
    pub locked_by: Option<WorkerId>,
    /// Snapshot bound: only jobs created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
    pub completed_after: Option<DateTime<Utc>>,
    /// Keyset cursor: only jobs with a greater id.
    pub after_id: Option<JobId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_band(mut self, band: PriorityBand) -> Self {
        self.band = Some(band);
        self
    }

    pub fn with_processor(mut self, key: impl Into<String>) -> Self {
        self.processor_key = Some(key.into());
        self
    }

    pub fn with_locked_by(mut self, worker_id: WorkerId) -> Self {
        self.locked_by = Some(worker_id);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn completed_after(mut self, at: DateTime<Utc>) -> Self {
        self.completed_after = Some(at);
        self
    }

    pub fn after(mut self, id: Option<JobId>) -> Self {
        self.after_id = id;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub pool_owner: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl WorkerFilter {
    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_pool_owner(mut self, owner: impl Into<String>) -> Self {
        self.pool_owner = Some(owner.into());
        self
    }
}

/// Row of `count_by_status_band`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBandCount {
    pub status: JobStatus,
    pub band: PriorityBand,
    pub count: u64,
}

/// Durable job, worker and pool state.
///
/// Every state transition is atomic with respect to concurrent callers,
/// including callers in other processes sharing the same backend.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// The store's notion of the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Persist a new pending job.
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId>;

    async fn get(&self, job_id: JobId) -> QueueResult<JobItem>;

    /// Atomically lock the first eligible job matching `filter` for `worker_id`.
    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        worker_id: &WorkerId,
    ) -> QueueResult<Option<JobItem>>;

    /// Mark a job the caller holds as completed.
    async fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> QueueResult<JobItem>;

    /// Record a failed attempt on a job the caller holds.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        failure: &ProcessError,
        policy: &RetryPolicy,
    ) -> QueueResult<JobItem>;

    /// Return jobs locked for longer than `lock_ttl` to the retry queue.
    async fn reclaim_stale(&self, lock_ttl: Duration) -> QueueResult<Vec<JobItem>>;

    /// Return every job held by `worker_id` to the retry queue.
    async fn release_worker(&self, worker_id: &WorkerId) -> QueueResult<Vec<JobItem>>;

    /// One page of jobs, ordered by id.
    async fn query_page(&self, filter: &JobFilter) -> QueueResult<Vec<JobItem>>;

    /// Number of jobs matching `filter`, ignoring limit and offset.
    async fn count_jobs(&self, filter: &JobFilter) -> QueueResult<u64>;

    async fn count_by_status_band(&self) -> QueueResult<Vec<StatusBandCount>>;

    /// Creation time of the oldest job in `status`.
    async fn oldest_created_at(&self, status: JobStatus) -> QueueResult<Option<DateTime<Utc>>>;

    async fn last_dispatch(&self, band: PriorityBand) -> QueueResult<Option<DateTime<Utc>>>;

    async fn record_dispatch(&self, band: PriorityBand, at: DateTime<Utc>) -> QueueResult<()>;

    async fn register_worker(&self, record: &WorkerRecord) -> QueueResult<()>;

    /// Refresh the heartbeat of a worker record.
    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        current_job: Option<JobId>,
        processed_count: u64,
    ) -> QueueResult<()>;

    async fn set_worker_status(&self, worker_id: &WorkerId, status: WorkerStatus)
    -> QueueResult<()>;

    async fn get_worker(&self, worker_id: &WorkerId) -> QueueResult<Option<WorkerRecord>>;

    async fn list_workers(&self, filter: &WorkerFilter) -> QueueResult<Vec<WorkerRecord>>;

    async fn remove_worker(&self, worker_id: &WorkerId) -> QueueResult<()>;

    /// Take the pool lease, or fail with `PoolAlreadyRunning` while another owner keeps it fresh.
    async fn acquire_pool(
        &self,
        owner: &str,
        size: u32,
        stale_after: Duration,
    ) -> QueueResult<PoolLease>;

    /// Refresh the lease; the returned lease carries any pending stop request.
    async fn renew_pool(&self, owner: &str) -> QueueResult<PoolLease>;

    /// Ask the lease owner to stop. Returns false when no pool is running.
    async fn request_pool_stop(&self) -> QueueResult<bool>;

    async fn release_pool(&self, owner: &str) -> QueueResult<()>;

    async fn pool(&self) -> QueueResult<Option<PoolLease>>;
}

/// Lazy, restartable read over jobs matching a filter.
///
/// The snapshot bound is fixed when the query is built, so jobs enqueued
/// afterwards never appear, however often the query is restarted.
#[derive(Clone)]
pub struct JobQuery {
    store: Arc<dyn QueueStore>,
    filter: JobFilter,
    page_size: usize,
}

struct Cursor {
    after: Option<JobId>,
    buffered: VecDeque<JobItem>,
    exhausted: bool,
    remaining: Option<usize>,
}

impl JobQuery {
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    pub fn new(store: Arc<dyn QueueStore>, mut filter: JobFilter) -> Self {
        if filter.created_before.is_none() {
            filter.created_before = Some(store.now());
        }
        Self {
            store,
            filter,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.filter.created_before
    }

    /// Start (or restart) iteration from the first matching job.
    pub fn stream(&self) -> BoxStream<'static, QueueResult<JobItem>> {
        let store = self.store.clone();
        let base = JobFilter {
            limit: None,
            offset: None,
            after_id: None,
            ..self.filter.clone()
        };
        let page_size = self.page_size;
        let cursor = Cursor {
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
            remaining: self.filter.limit,
        };

        stream::try_unfold(cursor, move |mut cursor| {
            let store = store.clone();
            let base = base.clone();
            async move {
                loop {
                    if cursor.remaining == Some(0) {
                        return Ok(None);
                    }
                    if let Some(job) = cursor.buffered.pop_front() {
                        cursor.after = Some(job.id);
                        if let Some(remaining) = cursor.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        return Ok(Some((job, cursor)));
                    }
                    if cursor.exhausted {
                        return Ok(None);
                    }
                    let page = store
                        .query_page(&base.clone().after(cursor.after).with_limit(page_size))
                        .await?;
                    if page.len() < page_size {
                        cursor.exhausted = true;
                    }
                    cursor.buffered.extend(page);
                }
            }
        })
        .boxed()
    }

    /// Drain the stream into a vector.
    pub async fn collect(&self) -> QueueResult<Vec<JobItem>> {
        let mut stream = self.stream();
        let mut jobs = Vec::new();
        while let Some(job) = stream.next().await {
            jobs.push(job?);
        }
        Ok(jobs)
    }
}
