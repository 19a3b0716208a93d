//! The claim, execute and settle cycle shared by pool workers and one-shot runs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use queue_core::{
    EngineConfig, JobEvent, JobId, JobItem, JobStatus, ProcessError, QueueError, QueueResult,
    QueueStore, RetryPolicy, WorkerId, WorkerRecord, WorkerStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::processor::{ProcessResult, ProcessorRegistry};
use crate::scheduler::{PriorityScheduler, SchedulingMode};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Where a worker is within its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Completing,
    Failing,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was eligible.
    Idle,
    Completed(JobId),
    /// Failed and scheduled for another attempt.
    Retrying(JobId),
    DeadLettered(JobId),
    /// Lost the lock before settling; the job was left alone.
    Conflict(JobId),
    /// The store could not be reached.
    StoreError(QueueError),
}

/// Limits for a bounded run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunBudget {
    pub max_jobs: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Stop after this many consecutive empty polls.
    pub max_idle_polls: Option<u32>,
}

impl RunBudget {
    /// Run until the queue is empty.
    pub fn until_idle() -> Self {
        Self {
            max_idle_polls: Some(1),
            ..Self::default()
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_max_idle_polls(mut self, polls: Option<u32>) -> Self {
        self.max_idle_polls = polls;
        self
    }

    fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.max_duration.map(|max| max.saturating_sub(elapsed))
    }
}

/// Totals of a bounded run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub conflicts: u64,
    pub store_errors: u64,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Idle => return,
            CycleOutcome::Completed(_) => self.completed += 1,
            CycleOutcome::Retrying(_) => self.retried += 1,
            CycleOutcome::DeadLettered(_) => self.dead_lettered += 1,
            CycleOutcome::Conflict(_) => self.conflicts += 1,
            CycleOutcome::StoreError(_) => {
                self.store_errors += 1;
                return;
            }
        }
        self.processed += 1;
    }
}

/// Executes one job at a time.
pub struct Worker {
    id: WorkerId,
    store: Arc<dyn QueueStore>,
    scheduler: PriorityScheduler,
    processors: Arc<ProcessorRegistry>,
    policy: RetryPolicy,
    processor_timeout: Duration,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    store_backoff_max: Duration,
    /// How long after a claim a settle may still be retried.
    settle_window: Duration,
    state: WorkerState,
    processed_count: u64,
    store_failures: u32,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn QueueStore>,
        processors: Arc<ProcessorRegistry>,
        config: &EngineConfig,
        mode: SchedulingMode,
    ) -> Self {
        let lock_ttl = Duration::from_secs(config.supervisor.lock_ttl_secs);
        Self {
            id,
            scheduler: PriorityScheduler::new(store.clone(), config, mode),
            store,
            processors,
            policy: RetryPolicy::new(config.retry.clone()),
            processor_timeout: config.worker.processor_timeout(),
            heartbeat_interval: config.supervisor.heartbeat_interval().max(MIN_TICK),
            poll_interval: config.worker.poll_interval(),
            store_backoff_max: config.worker.store_backoff_max(),
            settle_window: lock_ttl.saturating_sub(lock_ttl / 10),
            state: WorkerState::Idle,
            processed_count: 0,
            store_failures: 0,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn mode(&self) -> SchedulingMode {
        self.scheduler.mode()
    }

    /// Jobs this worker completed.
    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Delay before the next store attempt after consecutive failures.
    pub fn store_backoff(&self) -> Duration {
        self.backoff_for(self.store_failures)
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.poll_interval
            .saturating_mul(1u32 << exponent)
            .min(self.store_backoff_max)
    }

    /// Write a `starting` worker record.
    pub async fn register(
        &self,
        process_handle: &str,
        pool_owner: Option<&str>,
    ) -> QueueResult<()> {
        let mut record = WorkerRecord::new(self.id.clone(), process_handle, self.store.now());
        if let Some(owner) = pool_owner {
            record = record.with_pool_owner(owner);
        }
        self.store.register_worker(&record).await?;
        self.emit(JobEvent::WorkerStarted {
            worker_id: self.id.clone(),
            timestamp: self.store.now(),
        });
        Ok(())
    }

    pub async fn set_status(&self, status: WorkerStatus) -> QueueResult<()> {
        self.store.set_worker_status(&self.id, status).await
    }

    /// Mark the record stopped, hand back anything still held and remove the record.
    pub async fn deregister(&self) -> QueueResult<()> {
        match self.store.set_worker_status(&self.id, WorkerStatus::Stopped).await {
            Ok(()) | Err(QueueError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.release_worker(&self.id).await?;
        self.store.remove_worker(&self.id).await?;
        self.emit(JobEvent::WorkerStopped {
            worker_id: self.id.clone(),
            processed_count: self.processed_count,
            timestamp: self.store.now(),
        });
        Ok(())
    }

    /// Run one claim, execute and settle cycle.
    pub async fn cycle(&mut self) -> CycleOutcome {
        self.state = WorkerState::Claiming;
        let job = match self.scheduler.claim_next(&self.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.state = WorkerState::Idle;
                self.store_failures = 0;
                self.heartbeat(None).await;
                return CycleOutcome::Idle;
            }
            Err(e) => {
                self.state = WorkerState::Idle;
                self.store_failures = self.store_failures.saturating_add(1);
                tracing::warn!(
                    worker_id = %self.id,
                    failures = self.store_failures,
                    "Claim failed: {}",
                    e
                );
                return CycleOutcome::StoreError(e);
            }
        };
        self.store_failures = 0;
        let claimed = Instant::now();

        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id,
            band = %job.priority_band,
            processor = %job.processor_key,
            attempt = job.attempt_count + 1,
            "Executing job"
        );
        self.emit(JobEvent::JobClaimed {
            job_id: job.id,
            band: job.priority_band,
            worker_id: self.id.clone(),
            timestamp: self.store.now(),
        });
        self.heartbeat(Some(job.id)).await;

        self.state = WorkerState::Executing;
        let started = Instant::now();
        let result = self.execute(&job).await;
        let duration = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                self.state = WorkerState::Completing;
                self.settle_completed(&job, claimed, duration).await
            }
            Err(failure) => {
                self.state = WorkerState::Failing;
                self.settle_failed(&job, claimed, failure).await
            }
        };

        self.state = WorkerState::Idle;
        self.heartbeat(None).await;
        outcome
    }

    /// Cycle until the budget runs out.
    pub async fn run(&mut self, budget: RunBudget) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut idle_polls = 0u32;

        tracing::info!(worker_id = %self.id, mode = %self.mode(), "Run started");

        loop {
            if budget.max_jobs.is_some_and(|max| report.processed >= max) {
                break;
            }
            if budget.remaining(started.elapsed()) == Some(Duration::ZERO) {
                break;
            }

            let outcome = self.cycle().await;
            report.record(&outcome);

            let delay = match outcome {
                CycleOutcome::Idle => {
                    idle_polls += 1;
                    if budget.max_idle_polls.is_some_and(|max| idle_polls >= max) {
                        break;
                    }
                    self.poll_interval
                }
                CycleOutcome::StoreError(_) => self.store_backoff(),
                _ => {
                    idle_polls = 0;
                    continue;
                }
            };

            let delay = budget
                .remaining(started.elapsed())
                .map_or(delay, |remaining| remaining.min(delay));
            tokio::time::sleep(delay).await;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            worker_id = %self.id,
            processed = report.processed,
            completed = report.completed,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Run finished"
        );
        report
    }

    async fn execute(&self, job: &JobItem) -> ProcessResult {
        let call = AssertUnwindSafe(self.processors.dispatch(job)).catch_unwind();
        let timed = tokio::time::timeout(self.processor_timeout, call);
        tokio::pin!(timed);

        // Keep the record fresh while a long call runs.
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await;
        let finished = loop {
            tokio::select! {
                finished = &mut timed => break finished,
                _ = ticker.tick() => self.heartbeat(Some(job.id)).await,
            }
        };

        match finished {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProcessError::transient("processor panicked")),
            Err(_) => Err(ProcessError::transient(format!(
                "processor timed out after {}s",
                self.processor_timeout.as_secs_f64()
            ))),
        }
    }

    async fn settle_completed(
        &mut self,
        job: &JobItem,
        claimed: Instant,
        elapsed: Duration,
    ) -> CycleOutcome {
        let settled = loop {
            match self.store.complete(job.id, &self.id).await {
                Err(e) if e.is_store_unavailable() => match self.settle_retry_delay(claimed) {
                    Some(delay) => {
                        tracing::warn!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            retry_in_ms = delay.as_millis() as u64,
                            "Completion not recorded, retrying: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(e),
                },
                other => break other,
            }
        };

        match settled {
            Ok(done) => {
                self.store_failures = 0;
                self.processed_count += 1;
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %done.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                self.emit(JobEvent::JobCompleted {
                    job_id: done.id,
                    worker_id: self.id.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                    timestamp: self.store.now(),
                });
                CycleOutcome::Completed(done.id)
            }
            Err(e) => self.settle_error(job.id, e),
        }
    }

    async fn settle_failed(
        &mut self,
        job: &JobItem,
        claimed: Instant,
        failure: ProcessError,
    ) -> CycleOutcome {
        let settled = loop {
            match self.store.fail(job.id, &self.id, &failure, &self.policy).await {
                Err(e) if e.is_store_unavailable() => match self.settle_retry_delay(claimed) {
                    Some(delay) => {
                        tracing::warn!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            retry_in_ms = delay.as_millis() as u64,
                            "Failure not recorded, retrying: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => break Err(e),
                },
                other => break other,
            }
        };
        if settled.is_ok() {
            self.store_failures = 0;
        }

        match settled {
            Ok(failed) if failed.status == JobStatus::DeadLetter => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %failed.id,
                    attempts = failed.attempt_count,
                    "Job dead-lettered: {}",
                    failure
                );
                self.emit(JobEvent::JobDeadLettered {
                    job_id: failed.id,
                    error: failure.message().to_string(),
                    attempt_count: failed.attempt_count,
                    timestamp: self.store.now(),
                });
                CycleOutcome::DeadLettered(failed.id)
            }
            Ok(failed) => {
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %failed.id,
                    attempts = failed.attempt_count,
                    retry_at = %failed.next_eligible_at,
                    "Job failed, retry scheduled: {}",
                    failure
                );
                self.emit(JobEvent::JobRetryScheduled {
                    job_id: failed.id,
                    error: failure.message().to_string(),
                    attempt_count: failed.attempt_count,
                    retry_at: failed.next_eligible_at,
                    timestamp: self.store.now(),
                });
                CycleOutcome::Retrying(failed.id)
            }
            Err(e) => self.settle_error(job.id, e),
        }
    }

    /// Backoff before retrying a settle, or `None` once the retry would run
    /// into the part of the lock TTL where the job may be reclaimed.
    fn settle_retry_delay(&mut self, claimed: Instant) -> Option<Duration> {
        let failures = self.store_failures.saturating_add(1);
        let delay = self.backoff_for(failures);
        if claimed.elapsed() + delay >= self.settle_window {
            return None;
        }
        self.store_failures = failures;
        Some(delay)
    }

    fn settle_error(&mut self, job_id: JobId, error: QueueError) -> CycleOutcome {
        match error {
            QueueError::LockConflict { .. } => {
                tracing::warn!(worker_id = %self.id, job_id = %job_id, "Dropping result: {}", error);
                self.emit(JobEvent::LockConflict {
                    job_id,
                    worker_id: self.id.clone(),
                    timestamp: self.store.now(),
                });
                CycleOutcome::Conflict(job_id)
            }
            // Out of settle window; the lock stays until reclaimed.
            e => {
                self.store_failures = self.store_failures.saturating_add(1);
                tracing::error!(worker_id = %self.id, job_id = %job_id, "Failed to settle job: {}", e);
                CycleOutcome::StoreError(e)
            }
        }
    }

    async fn heartbeat(&self, current_job: Option<JobId>) {
        if let Err(e) = self
            .store
            .heartbeat(&self.id, current_job, self.processed_count)
            .await
        {
            match e {
                QueueError::NotFound(_) => {
                    tracing::trace!(worker_id = %self.id, "No worker record to heartbeat")
                }
                e => tracing::warn!(worker_id = %self.id, "Heartbeat failed: {}", e),
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
