//! Recovery of work left behind by workers that died mid-job.
//!
//! Shared by the supervisor's health check and by one-shot runs, so a
//! crashed `run` is cleaned up by the next one even when no pool exists.

use std::sync::Arc;

use queue_core::{
    EngineConfig, JobEvent, QueueError, QueueStore, WorkerFilter, WorkerId, WorkerStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;

/// What one sweep recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs whose locks outlived the lock TTL.
    pub reclaimed: usize,
    /// Live worker records whose heartbeat expired.
    pub crashed: Vec<WorkerId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed == 0 && self.crashed.is_empty()
    }
}

/// Reclaims expired locks and retires workers that stopped heartbeating.
#[derive(Clone)]
pub struct StaleRecovery {
    store: Arc<dyn QueueStore>,
    lock_ttl: chrono::Duration,
    worker_ttl: chrono::Duration,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl StaleRecovery {
    pub fn new(store: Arc<dyn QueueStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            lock_ttl: config.supervisor.lock_ttl(),
            worker_ttl: config.supervisor.worker_ttl(),
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Reclaim expired locks, then retire silent workers.
    pub async fn sweep(&self) -> RecoveryReport {
        let reclaimed = self.reclaim_locks().await;
        let crashed = self.crash_silent_workers().await;
        if reclaimed > 0 || !crashed.is_empty() {
            tracing::info!(reclaimed, crashed = crashed.len(), "Recovered abandoned work");
        }
        RecoveryReport { reclaimed, crashed }
    }

    /// Return jobs locked past the lock TTL to the retry queue.
    pub async fn reclaim_locks(&self) -> usize {
        match self.store.reclaim_stale(self.lock_ttl).await {
            Ok(reclaimed) => {
                for job in &reclaimed {
                    self.emit(JobEvent::JobReclaimed {
                        job_id: job.id,
                        previous_owner: None,
                        timestamp: self.store.now(),
                    });
                }
                reclaimed.len()
            }
            Err(e) => {
                tracing::warn!("Stale lock reclaim failed: {}", e);
                0
            }
        }
    }

    /// Mark every live worker whose heartbeat expired as crashed and hand
    /// its jobs back.
    pub async fn crash_silent_workers(&self) -> Vec<WorkerId> {
        let records = match self.store.list_workers(&WorkerFilter::default()).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Worker scan failed: {}", e);
                return Vec::new();
            }
        };

        let now = self.store.now();
        let mut crashed = Vec::new();
        for record in records
            .into_iter()
            .filter(|r| r.is_stale(now, self.worker_ttl))
        {
            tracing::warn!(
                worker_id = %record.worker_id,
                last_heartbeat_at = %record.last_heartbeat_at,
                "Worker heartbeat expired"
            );
            self.retire(&record.worker_id, WorkerStatus::Crashed).await;
            self.emit(JobEvent::WorkerCrashed {
                worker_id: record.worker_id.clone(),
                reason: "heartbeat expired".to_string(),
                timestamp: now,
            });
            crashed.push(record.worker_id);
        }
        crashed
    }

    /// Record `status` for a worker and release whatever it still holds.
    /// Stopped records are removed.
    pub async fn retire(&self, worker_id: &WorkerId, status: WorkerStatus) {
        if let Err(e) = self.store.set_worker_status(worker_id, status).await
            && !matches!(e, QueueError::NotFound(_))
        {
            tracing::warn!(worker_id = %worker_id, "Failed to update worker status: {}", e);
        }

        match self.store.release_worker(worker_id).await {
            Ok(released) => {
                for job in released {
                    self.emit(JobEvent::JobReclaimed {
                        job_id: job.id,
                        previous_owner: Some(worker_id.clone()),
                        timestamp: self.store.now(),
                    });
                }
            }
            Err(e) => tracing::warn!(worker_id = %worker_id, "Failed to release jobs: {}", e),
        }

        if status == WorkerStatus::Stopped
            && let Err(e) = self.store.remove_worker(worker_id).await
        {
            tracing::warn!(worker_id = %worker_id, "Failed to remove worker record: {}", e);
        }
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
