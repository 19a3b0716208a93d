#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{FnProcessor, ProcessorRegistry};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use db::{DbConfig, DbError, SurrealQueueStore};
use queue_core::{
    ClaimFilter, EngineConfig, JobFilter, JobId, JobItem, JobStatus, ManualClock, NewJob,
    PoolLease, PriorityBand, ProcessError, QueueError, QueueResult, QueueStore, RetryConfig,
    RetryPolicy, StatusBandCount, WorkerFilter, WorkerId, WorkerRecord, WorkerStatus,
};

/// Fixed start so millisecond storage never truncates test timestamps.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_735_689_600_000)
        .single()
        .unwrap_or_default()
}

/// Fresh in-memory store driven by a manual clock.
pub async fn setup_store() -> Result<(Arc<SurrealQueueStore>, Arc<ManualClock>), DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SurrealQueueStore::new(db).with_clock(clock.clone());
    Ok((Arc::new(store), clock))
}

/// Engine settings with fast polling and no retry jitter.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.poll_interval_ms = 10;
    config.worker.processor_timeout_secs = 1;
    config.supervisor.heartbeat_interval_secs = 30;
    config.supervisor.drain_timeout_secs = 5;
    config.retry = RetryConfig {
        base_delay_ms: 10_000,
        max_delay_ms: 600_000,
        jitter_fraction: 0.0,
        jitter_seed: 0,
    };
    config
}

/// Processor keys seen, in execution order.
pub type Log = Arc<Mutex<Vec<String>>>;

/// Registry with `record` (logs its payload `name`), `flaky` (always transient),
/// `fatal` (always terminal), `slow` (outlives the processor timeout) and
/// `panic` (panics mid-attempt).
pub fn registry(log: Log) -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with(FnProcessor::new("record", move |job| {
            let log = log.clone();
            let name = job.payload["name"].as_str().unwrap_or_default().to_string();
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(())
            })
        }))
        .with(FnProcessor::new("flaky", |_job| {
            Box::pin(async { Err(ProcessError::transient("upstream unavailable")) })
        }))
        .with(FnProcessor::new("fatal", |_job| {
            Box::pin(async { Err(ProcessError::terminal("payload rejected")) })
        }))
        .with(FnProcessor::new("slow", |_job| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        }))
        .with(FnProcessor::new("panic", |_job| {
            Box::pin(async { panic!("processor bug") })
        }))
}

/// Poll `check` until it holds or ten seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Unique pool owner so parallel tests never share actor names.
pub fn owner(prefix: &str) -> String {
    format!("{}-{}", prefix, queue_core::JobId::new())
}

/// Store whose claims and settles can be made to fail as if the backend
/// were unreachable. Everything else goes straight to the inner store.
pub struct OutageStore {
    inner: Arc<SurrealQueueStore>,
    failing_claims: AtomicU32,
    failing_settles: AtomicU32,
}

impl OutageStore {
    pub fn new(inner: Arc<SurrealQueueStore>) -> Self {
        Self {
            inner,
            failing_claims: AtomicU32::new(0),
            failing_settles: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` claims.
    pub fn fail_claims(&self, n: u32) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` completes or fails.
    pub fn fail_settles(&self, n: u32) {
        self.failing_settles.store(n, Ordering::SeqCst);
    }

    pub fn settles_left_to_fail(&self) -> u32 {
        self.failing_settles.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> QueueResult<()> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(QueueError::StoreUnavailable("connection refused".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl QueueStore for OutageStore {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        self.inner.enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> QueueResult<JobItem> {
        self.inner.get(job_id).await
    }

    async fn claim_next(
        &self,
        filter: &ClaimFilter,
        worker_id: &WorkerId,
    ) -> QueueResult<Option<JobItem>> {
        Self::take(&self.failing_claims)?;
        self.inner.claim_next(filter, worker_id).await
    }

    async fn complete(&self, job_id: JobId, worker_id: &WorkerId) -> QueueResult<JobItem> {
        Self::take(&self.failing_settles)?;
        self.inner.complete(job_id, worker_id).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        failure: &ProcessError,
        policy: &RetryPolicy,
    ) -> QueueResult<JobItem> {
        Self::take(&self.failing_settles)?;
        self.inner.fail(job_id, worker_id, failure, policy).await
    }

    async fn reclaim_stale(&self, lock_ttl: chrono::Duration) -> QueueResult<Vec<JobItem>> {
        self.inner.reclaim_stale(lock_ttl).await
    }

    async fn release_worker(&self, worker_id: &WorkerId) -> QueueResult<Vec<JobItem>> {
        self.inner.release_worker(worker_id).await
    }

    async fn query_page(&self, filter: &JobFilter) -> QueueResult<Vec<JobItem>> {
        self.inner.query_page(filter).await
    }

    async fn count_jobs(&self, filter: &JobFilter) -> QueueResult<u64> {
        self.inner.count_jobs(filter).await
    }

    async fn count_by_status_band(&self) -> QueueResult<Vec<StatusBandCount>> {
        self.inner.count_by_status_band().await
    }

    async fn oldest_created_at(&self, status: JobStatus) -> QueueResult<Option<DateTime<Utc>>> {
        self.inner.oldest_created_at(status).await
    }

    async fn last_dispatch(&self, band: PriorityBand) -> QueueResult<Option<DateTime<Utc>>> {
        self.inner.last_dispatch(band).await
    }

    async fn record_dispatch(&self, band: PriorityBand, at: DateTime<Utc>) -> QueueResult<()> {
        self.inner.record_dispatch(band, at).await
    }

    async fn register_worker(&self, record: &WorkerRecord) -> QueueResult<()> {
        self.inner.register_worker(record).await
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        current_job: Option<JobId>,
        processed_count: u64,
    ) -> QueueResult<()> {
        self.inner
            .heartbeat(worker_id, current_job, processed_count)
            .await
    }

    async fn set_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> QueueResult<()> {
        self.inner.set_worker_status(worker_id, status).await
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> QueueResult<Option<WorkerRecord>> {
        self.inner.get_worker(worker_id).await
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> QueueResult<Vec<WorkerRecord>> {
        self.inner.list_workers(filter).await
    }

    async fn remove_worker(&self, worker_id: &WorkerId) -> QueueResult<()> {
        self.inner.remove_worker(worker_id).await
    }

    async fn acquire_pool(
        &self,
        owner: &str,
        size: u32,
        stale_after: chrono::Duration,
    ) -> QueueResult<PoolLease> {
        self.inner.acquire_pool(owner, size, stale_after).await
    }

    async fn renew_pool(&self, owner: &str) -> QueueResult<PoolLease> {
        self.inner.renew_pool(owner).await
    }

    async fn request_pool_stop(&self) -> QueueResult<bool> {
        self.inner.request_pool_stop().await
    }

    async fn release_pool(&self, owner: &str) -> QueueResult<()> {
        self.inner.release_pool(owner).await
    }

    async fn pool(&self) -> QueueResult<Option<PoolLease>> {
        self.inner.pool().await
    }
}
