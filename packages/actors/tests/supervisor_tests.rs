#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::{Arc, Mutex};

use actors::{ActorError, SchedulingMode, start_supervisor};
use chrono::Duration;
use queue_core::{
    JobEvent, JobFilter, JobStatus, NewJob, PriorityBand, QueueError, QueueStore, WorkerFilter,
    WorkerId, WorkerRecord, WorkerStatus,
};
use serde_json::json;

use common::{eventually, owner, registry, setup_store, test_config};

fn record(name: &str) -> NewJob {
    NewJob::new("record", json!({ "name": name })).with_band(PriorityBand::URGENT)
}

#[tokio::test]
async fn pool_processes_jobs_and_stops_cleanly() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = setup_store().await?;
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..6 {
        store.enqueue(record(&format!("job-{}", i))).await?;
    }

    let supervisor = start_supervisor(
        owner("pool"),
        store.clone(),
        Arc::new(registry(log.clone())),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;

    let status = supervisor.start(3).await?;
    assert!(status.running);
    assert_eq!(status.target_size, 3);
    assert_eq!(status.live_workers, 3);
    assert_eq!(store.pool().await?.map(|p| p.owner), Some(supervisor.owner().to_string()));

    let done = eventually(|| {
        let store = store.clone();
        async move {
            store
                .count_jobs(&JobFilter::default().with_status(JobStatus::Completed))
                .await
                .unwrap_or(0)
                == 6
        }
    })
    .await;
    assert!(done, "jobs were not completed");
    assert_eq!(log.lock().unwrap().len(), 6);

    let handle = &supervisor;
    let counted = eventually(|| async move {
        handle
            .status()
            .await
            .map(|s| s.processed_total == 6)
            .unwrap_or(false)
    })
    .await;
    assert!(counted, "heartbeats never reported the processed jobs");

    let status = supervisor.status().await?;
    assert_eq!(status.workers.len(), 3);
    assert!(status.workers.iter().all(|w| w.status == WorkerStatus::Running));

    supervisor.stop().await?;
    assert!(store.pool().await?.is_none());
    let remaining = store
        .list_workers(&WorkerFilter::default().with_pool_owner(supervisor.owner()))
        .await?;
    assert!(remaining.is_empty());

    supervisor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn second_pool_is_refused() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = setup_store().await?;
    let processors = Arc::new(registry(Arc::new(Mutex::new(Vec::new()))));

    let first = start_supervisor(
        owner("first"),
        store.clone(),
        processors.clone(),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;
    let second = start_supervisor(
        owner("second"),
        store.clone(),
        processors,
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;

    first.start(1).await?;

    match second.start(1).await {
        Err(ActorError::Queue(QueueError::PoolAlreadyRunning { owner })) => {
            assert_eq!(owner, first.owner());
        }
        other => panic!("expected PoolAlreadyRunning, got {:?}", other.map(|s| s.owner)),
    }

    // Starting twice on the same supervisor is refused too.
    assert!(matches!(
        first.start(1).await,
        Err(ActorError::Queue(QueueError::PoolAlreadyRunning { .. }))
    ));

    // Once the first pool stops, the second may take over.
    first.stop().await?;
    let status = second.start(1).await?;
    assert!(status.running);

    second.shutdown().await?;
    first.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn restart_replaces_the_pool() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = setup_store().await?;
    let supervisor = start_supervisor(
        owner("restart"),
        store.clone(),
        Arc::new(registry(Arc::new(Mutex::new(Vec::new())))),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;

    let before = supervisor.start(2).await?;
    let after = supervisor.restart(1).await?;

    assert_eq!(after.target_size, 1);
    assert_eq!(after.workers.len(), 1);
    let old: Vec<WorkerId> = before.workers.iter().map(|w| w.worker_id.clone()).collect();
    assert!(!old.contains(&after.workers[0].worker_id));

    supervisor.shutdown().await?;
    assert!(store.pool().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn stop_request_through_the_store_stops_the_pool() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = setup_store().await?;
    let mut supervisor = start_supervisor(
        owner("remote"),
        store.clone(),
        Arc::new(registry(Arc::new(Mutex::new(Vec::new())))),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;
    supervisor.start(2).await?;

    assert!(store.request_pool_stop().await?);
    let report = supervisor.check_health().await?;
    assert!(report.stop_requested);

    tokio::time::timeout(std::time::Duration::from_secs(10), supervisor.stopped()).await?;
    assert!(store.pool().await?.is_none());
    assert!(
        store
            .list_workers(&WorkerFilter::default().with_pool_owner(supervisor.owner()))
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn health_check_recovers_silent_workers() -> Result<(), Box<dyn Error>> {
    let (store, clock) = setup_store().await?;
    let supervisor = start_supervisor(
        owner("health"),
        store.clone(),
        Arc::new(registry(Arc::new(Mutex::new(Vec::new())))),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;

    // A worker in another process claimed a job and went silent.
    let ghost = WorkerId::from("worker-ghost");
    let mut ghost_record = WorkerRecord::new(ghost.clone(), "pid:999/ghost", store.now());
    ghost_record.status = WorkerStatus::Running;
    store.register_worker(&ghost_record).await?;
    let id = store.enqueue(record("held")).await?;
    store
        .claim_next(&queue_core::ClaimFilter::new(vec![PriorityBand::URGENT]), &ghost)
        .await?
        .ok_or("claim failed")?;

    clock.advance(Duration::seconds(61));
    let report = supervisor.check_health().await?;

    assert_eq!(report.crashed, vec![ghost.clone()]);
    assert_eq!(report.reclaimed, 0);
    let ghost_record = store.get_worker(&ghost).await?.ok_or("record removed")?;
    assert_eq!(ghost_record.status, WorkerStatus::Crashed);

    let job = store.get(id).await?;
    assert_eq!(job.status, JobStatus::RetryPending);
    assert_eq!(job.attempt_count, 1);

    supervisor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn health_check_reclaims_expired_locks() -> Result<(), Box<dyn Error>> {
    let (store, clock) = setup_store().await?;
    let supervisor = start_supervisor(
        owner("locks"),
        store.clone(),
        Arc::new(registry(Arc::new(Mutex::new(Vec::new())))),
        test_config(),
        SchedulingMode::Cascading,
    )
    .await?;

    // Locked by a worker that never registered.
    let id = store.enqueue(record("held")).await?;
    store
        .claim_next(
            &queue_core::ClaimFilter::new(vec![PriorityBand::URGENT]),
            &WorkerId::from("worker-unregistered"),
        )
        .await?
        .ok_or("claim failed")?;

    clock.advance(Duration::seconds(299));
    assert_eq!(supervisor.check_health().await?.reclaimed, 0);

    clock.advance(Duration::seconds(2));
    assert_eq!(supervisor.check_health().await?.reclaimed, 1);
    assert_eq!(store.get(id).await?.status, JobStatus::RetryPending);

    supervisor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn workers_recycle_after_their_allowance() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = setup_store().await?;
    let mut config = test_config();
    config.worker.max_jobs_per_worker = Some(2);

    for i in 0..5 {
        store.enqueue(record(&format!("job-{}", i))).await?;
    }

    let supervisor = start_supervisor(
        owner("recycle"),
        store.clone(),
        Arc::new(registry(Arc::new(Mutex::new(Vec::new())))),
        config,
        SchedulingMode::Cascading,
    )
    .await?;
    let mut events = supervisor.subscribe();
    supervisor.start(1).await?;

    let done = eventually(|| {
        let store = store.clone();
        async move {
            store
                .count_jobs(&JobFilter::default().with_status(JobStatus::Completed))
                .await
                .unwrap_or(0)
                == 5
        }
    })
    .await;
    assert!(done, "jobs were not completed");

    let mut started = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, JobEvent::WorkerStarted { .. }) {
            started += 1;
        }
    }
    assert!(started >= 3, "expected recycled workers, saw {} starts", started);

    supervisor.shutdown().await?;
    Ok(())
}
