#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;

use chrono::Duration;
use futures_util::StreamExt;
use queue_core::{
    ClaimFilter, JobFilter, JobQuery, JobStatus, NewJob, PriorityBand, ProcessError, QueueError,
    QueueStore, RetryConfig, RetryPolicy, WorkerFilter, WorkerId, WorkerRecord, WorkerStatus,
};
use serde_json::json;

fn all_bands() -> ClaimFilter {
    ClaimFilter::new(vec![
        PriorityBand::URGENT,
        PriorityBand::HIGH,
        PriorityBand::NORMAL,
        PriorityBand::LOW,
    ])
}

fn job(key: &str, band: PriorityBand) -> NewJob {
    NewJob::new(key, json!({"key": key})).with_band(band)
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        base_delay_ms: 10_000,
        max_delay_ms: 600_000,
        jitter_fraction: 0.0,
        jitter_seed: 0,
    })
}

#[tokio::test]
async fn claims_follow_band_then_fifo() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");

    let normal_a = store.enqueue(job("normal-a", PriorityBand::NORMAL)).await?;
    let urgent = store.enqueue(job("urgent", PriorityBand::URGENT)).await?;
    let normal_b = store.enqueue(job("normal-b", PriorityBand::NORMAL)).await?;
    let high = store.enqueue(job("high", PriorityBand::HIGH)).await?;

    let mut order = Vec::new();
    while let Some(claimed) = store.claim_next(&all_bands(), &worker).await? {
        assert_eq!(claimed.status, JobStatus::Locked);
        assert_eq!(claimed.locked_by.as_ref(), Some(&worker));
        order.push(claimed.id);
    }

    assert_eq!(order, vec![urgent, high, normal_a, normal_b]);
    Ok(())
}

#[tokio::test]
async fn single_band_filter_skips_other_bands() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");

    store.enqueue(job("urgent", PriorityBand::URGENT)).await?;
    let low = store.enqueue(job("low", PriorityBand::LOW)).await?;

    let filter = ClaimFilter::new(vec![PriorityBand::LOW]);
    let claimed = store.claim_next(&filter, &worker).await?;
    assert_eq!(claimed.map(|j| j.id), Some(low));
    assert!(store.claim_next(&filter, &worker).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn transient_failures_retry_then_dead_letter() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let id = store
        .enqueue(job("flaky", PriorityBand::HIGH).with_max_attempts(2))
        .await?;

    let claimed = store.claim_next(&all_bands(), &worker).await?;
    assert_eq!(claimed.map(|j| j.id), Some(id));

    let failed = store
        .fail(id, &worker, &ProcessError::transient("timeout"), &policy())
        .await?;
    assert_eq!(failed.status, JobStatus::RetryPending);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("timeout"));
    assert_eq!(failed.locked_by, None);
    assert_eq!(failed.next_eligible_at, common::epoch() + Duration::seconds(10));

    // Not eligible until the backoff has elapsed.
    assert!(store.claim_next(&all_bands(), &worker).await?.is_none());
    clock.advance(Duration::seconds(10));
    let again = store.claim_next(&all_bands(), &worker).await?;
    assert_eq!(again.map(|j| j.id), Some(id));

    let dead = store
        .fail(id, &worker, &ProcessError::transient("timeout"), &policy())
        .await?;
    assert_eq!(dead.status, JobStatus::DeadLetter);
    assert_eq!(dead.attempt_count, 2);
    assert!(dead.dead_lettered_at.is_some());

    clock.advance(Duration::hours(24));
    assert!(store.claim_next(&all_bands(), &worker).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn three_attempts_end_in_dead_letter() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let id = store.enqueue(job("always-fails", PriorityBand::NORMAL)).await?;

    let mut previous_eligible = None;
    for attempt in 1..=3u32 {
        let claimed = store.claim_next(&all_bands(), &worker).await?;
        assert_eq!(claimed.map(|j| j.id), Some(id), "attempt {attempt}");
        let after = store
            .fail(id, &worker, &ProcessError::transient("boom"), &policy())
            .await?;
        assert_eq!(after.attempt_count, attempt);
        assert!(after.attempt_count <= after.max_attempts);

        if attempt < 3 {
            assert_eq!(after.status, JobStatus::RetryPending);
            if let Some(previous) = previous_eligible {
                assert!(after.next_eligible_at > previous);
            }
            previous_eligible = Some(after.next_eligible_at);
            clock.advance(Duration::hours(1));
        } else {
            assert_eq!(after.status, JobStatus::DeadLetter);
        }
    }
    Ok(())
}

#[tokio::test]
async fn terminal_failure_skips_retries() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let id = store.enqueue(job("bad-input", PriorityBand::NORMAL)).await?;

    store.claim_next(&all_bands(), &worker).await?;
    let dead = store
        .fail(id, &worker, &ProcessError::terminal("malformed payload"), &policy())
        .await?;
    assert_eq!(dead.status, JobStatus::DeadLetter);
    assert_eq!(dead.attempt_count, 1);
    assert_eq!(dead.last_error.as_deref(), Some("malformed payload"));
    Ok(())
}

#[tokio::test]
async fn stale_lock_is_reclaimed() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let crashed = WorkerId::from("w-crashed");
    let rescuer = WorkerId::from("w-rescuer");
    let id = store.enqueue(job("long", PriorityBand::URGENT)).await?;

    store.claim_next(&all_bands(), &crashed).await?;

    // Within the TTL nothing happens.
    clock.advance(Duration::seconds(299));
    assert!(store.reclaim_stale(Duration::seconds(300)).await?.is_empty());

    clock.advance(Duration::seconds(2));
    let reclaimed = store.reclaim_stale(Duration::seconds(300)).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);
    assert_eq!(reclaimed[0].status, JobStatus::RetryPending);
    assert_eq!(reclaimed[0].attempt_count, 1);
    assert_eq!(reclaimed[0].locked_by, None);

    // The original owner can no longer settle it.
    let late = store.complete(id, &crashed).await;
    assert!(matches!(late, Err(QueueError::LockConflict { .. })));

    let rescued = store.claim_next(&all_bands(), &rescuer).await?;
    assert_eq!(rescued.map(|j| j.id), Some(id));
    let done = store.complete(id, &rescuer).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt_count, 2);
    Ok(())
}

#[tokio::test]
async fn reclaim_dead_letters_exhausted_jobs() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let id = store
        .enqueue(job("once", PriorityBand::URGENT).with_max_attempts(1))
        .await?;

    store.claim_next(&all_bands(), &worker).await?;
    clock.advance(Duration::minutes(10));
    let reclaimed = store.reclaim_stale(Duration::seconds(300)).await?;
    assert_eq!(reclaimed.len(), 1);

    let job = store.get(id).await?;
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempt_count, 1);
    Ok(())
}

#[tokio::test]
async fn release_worker_returns_held_jobs() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let gone = WorkerId::from("w-gone");
    let other = WorkerId::from("w-other");
    let mine = store.enqueue(job("a", PriorityBand::URGENT)).await?;
    let theirs = store.enqueue(job("b", PriorityBand::HIGH)).await?;

    store.claim_next(&all_bands(), &gone).await?;
    store.claim_next(&all_bands(), &other).await?;

    let released = store.release_worker(&gone).await?;
    assert_eq!(released.iter().map(|j| j.id).collect::<Vec<_>>(), vec![mine]);
    assert_eq!(store.get(mine).await?.status, JobStatus::RetryPending);
    assert_eq!(store.get(theirs).await?.status, JobStatus::Locked);
    Ok(())
}

#[tokio::test]
async fn completion_is_not_repeatable() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let id = store.enqueue(job("once", PriorityBand::NORMAL)).await?;

    store.claim_next(&all_bands(), &worker).await?;
    let done = store.complete(id, &worker).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());

    let second = store.complete(id, &worker).await;
    assert!(matches!(second, Err(QueueError::LockConflict { .. })));

    let failed_after = store
        .fail(id, &worker, &ProcessError::transient("late"), &policy())
        .await;
    assert!(matches!(failed_after, Err(QueueError::LockConflict { .. })));

    let unchanged = store.get(id).await?;
    assert_eq!(unchanged.status, JobStatus::Completed);
    assert_eq!(unchanged.attempt_count, 1);
    assert_eq!(unchanged.last_error, None);
    Ok(())
}

#[tokio::test]
async fn other_worker_cannot_settle() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    let owner = WorkerId::from("w-owner");
    let intruder = WorkerId::from("w-intruder");
    let id = store.enqueue(job("x", PriorityBand::NORMAL)).await?;
    store.claim_next(&all_bands(), &owner).await?;

    assert!(matches!(
        store.complete(id, &intruder).await,
        Err(QueueError::LockConflict { .. })
    ));
    assert_eq!(store.get(id).await?.locked_by, Some(owner));

    let missing = store.complete(queue_core::JobId::new(), &intruder).await;
    assert!(matches!(missing, Err(QueueError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn enqueue_validates_before_persisting() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;

    let bad_band = store.enqueue(job("x", PriorityBand(7))).await;
    assert!(matches!(bad_band, Err(QueueError::Validation(_))));

    let no_attempts = store
        .enqueue(job("x", PriorityBand::NORMAL).with_max_attempts(0))
        .await;
    assert!(matches!(no_attempts, Err(QueueError::Validation(_))));

    let no_key = store.enqueue(job("", PriorityBand::NORMAL)).await;
    assert!(matches!(no_key, Err(QueueError::Validation(_))));

    assert_eq!(store.count_jobs(&JobFilter::default()).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_job() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    const JOBS: usize = 40;
    for i in 0..JOBS {
        store
            .enqueue(job(&format!("job-{i}"), PriorityBand::NORMAL))
            .await?;
    }

    let mut tasks = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::from(format!("w-{n}").as_str());
            let mut claimed = Vec::new();
            let mut errors = 0;
            loop {
                match store.claim_next(&all_bands(), &worker).await {
                    Ok(Some(job)) => claimed.push((job.id, worker.clone())),
                    Ok(None) => break,
                    Err(_) if errors < 50 => errors += 1,
                    Err(_) => break,
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await?);
    }

    let unique: HashSet<_> = all.iter().map(|(id, _)| *id).collect();
    assert_eq!(unique.len(), all.len(), "a job was claimed twice");

    for (id, worker) in &all {
        assert_eq!(store.get(*id).await?.locked_by.as_ref(), Some(worker));
    }

    let pending = store
        .count_jobs(&JobFilter::default().with_status(JobStatus::Pending))
        .await?;
    assert_eq!(all.len() as u64 + pending, JOBS as u64);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_claims_do_not_report_an_empty_queue() -> Result<(), Box<dyn Error>> {
    let (store, _clock) = common::setup_store().await?;
    const WORKERS: usize = 8;
    for i in 0..WORKERS {
        store
            .enqueue(job(&format!("job-{i}"), PriorityBand::NORMAL))
            .await?;
    }

    let mut tasks = Vec::new();
    for n in 0..WORKERS {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::from(format!("w-{n}").as_str());
            store.claim_next(&all_bands(), &worker).await
        }));
    }

    let mut empty = 0;
    for task in tasks {
        if let Ok(None) = task.await? {
            empty += 1;
        }
    }
    assert_eq!(empty, 0, "a claim saw an empty queue while jobs were pending");
    Ok(())
}

#[tokio::test]
async fn query_is_lazy_restartable_snapshot() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(store.enqueue(job(&format!("j{i}"), PriorityBand::LOW)).await?);
    }

    let store: Arc<dyn QueueStore> = Arc::new(store);
    let query = JobQuery::new(store.clone(), JobFilter::default()).with_page_size(2);

    clock.advance(Duration::seconds(1));
    store.enqueue(job("late", PriorityBand::LOW)).await?;

    let first: Vec<_> = query.collect().await?.into_iter().map(|j| j.id).collect();
    assert_eq!(first, expected);

    // Restarting yields the same snapshot.
    let mut stream = query.stream();
    let mut second = Vec::new();
    while let Some(job) = stream.next().await {
        second.push(job?.id);
    }
    assert_eq!(second, expected);

    let limited = JobQuery::new(store.clone(), JobFilter::default().with_limit(3))
        .with_page_size(2)
        .collect()
        .await?;
    assert_eq!(limited.len(), 3);
    Ok(())
}

#[tokio::test]
async fn counts_and_listing() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    store.enqueue(job("a", PriorityBand::URGENT)).await?;
    store.enqueue(job("b", PriorityBand::NORMAL)).await?;
    store.enqueue(job("c", PriorityBand::NORMAL)).await?;
    let dead = store.enqueue(job("d", PriorityBand::LOW)).await?;

    // Dead-letter the low band job.
    let claim_low = ClaimFilter::new(vec![PriorityBand::LOW]);
    store.claim_next(&claim_low, &worker).await?;
    store
        .fail(dead, &worker, &ProcessError::terminal("nope"), &policy())
        .await?;

    let counts = store.count_by_status_band().await?;
    let pending_normal = counts
        .iter()
        .find(|c| c.status == JobStatus::Pending && c.band == PriorityBand::NORMAL)
        .map(|c| c.count);
    assert_eq!(pending_normal, Some(2));
    let dead_total: u64 = counts
        .iter()
        .filter(|c| c.status == JobStatus::DeadLetter)
        .map(|c| c.count)
        .sum();
    assert_eq!(dead_total, 1);

    let page = store
        .query_page(
            &JobFilter::default()
                .with_status(JobStatus::Pending)
                .with_limit(2)
                .with_offset(1),
        )
        .await?;
    assert_eq!(page.len(), 2);
    assert_eq!(
        store
            .count_jobs(&JobFilter::default().with_band(PriorityBand::NORMAL))
            .await?,
        2
    );

    clock.advance(Duration::minutes(5));
    assert_eq!(
        store.oldest_created_at(JobStatus::Pending).await?,
        Some(common::epoch())
    );
    Ok(())
}

#[tokio::test]
async fn worker_records_lifecycle() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let worker = WorkerId::from("w-1");
    let record = WorkerRecord::new(worker.clone(), "pid:1/w-1", store.now()).with_pool_owner("pool-a");
    store.register_worker(&record).await?;
    store
        .register_worker(&WorkerRecord::new(WorkerId::from("w-2"), "pid:2/w-2", store.now()))
        .await?;

    store.set_worker_status(&worker, WorkerStatus::Running).await?;
    clock.advance(Duration::seconds(5));
    let job = queue_core::JobId::new();
    store.heartbeat(&worker, Some(job), 3).await?;

    let loaded = store.get_worker(&worker).await?.ok_or("worker missing")?;
    assert_eq!(loaded.status, WorkerStatus::Running);
    assert_eq!(loaded.processed_count, 3);
    assert_eq!(loaded.current_job_id, Some(job));
    assert_eq!(loaded.last_heartbeat_at, common::epoch() + Duration::seconds(5));

    let pooled = store
        .list_workers(&WorkerFilter::default().with_pool_owner("pool-a"))
        .await?;
    assert_eq!(pooled.len(), 1);
    assert_eq!(store.list_workers(&WorkerFilter::default()).await?.len(), 2);

    store.remove_worker(&worker).await?;
    assert!(store.get_worker(&worker).await?.is_none());
    let missing = store.heartbeat(&worker, None, 0).await;
    assert!(matches!(missing, Err(QueueError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn pool_lease_is_exclusive() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    let stale_after = Duration::seconds(60);

    let lease = store.acquire_pool("daemon-a", 4, stale_after).await?;
    assert_eq!(lease.owner, "daemon-a");
    assert!(!lease.stop_requested);

    let second = store.acquire_pool("daemon-b", 2, stale_after).await;
    assert!(matches!(
        second,
        Err(QueueError::PoolAlreadyRunning { ref owner }) if owner == "daemon-a"
    ));

    assert!(store.request_pool_stop().await?);
    let renewed = store.renew_pool("daemon-a").await?;
    assert!(renewed.stop_requested);
    assert!(matches!(
        store.renew_pool("daemon-b").await,
        Err(QueueError::NotFound(_))
    ));

    store.release_pool("daemon-a").await?;
    assert!(store.pool().await?.is_none());
    assert!(!store.request_pool_stop().await?);

    store.acquire_pool("daemon-b", 2, stale_after).await?;
    clock.advance(Duration::seconds(61));
    let taken = store.acquire_pool("daemon-c", 1, stale_after).await?;
    assert_eq!(taken.owner, "daemon-c");
    assert!(!taken.stop_requested);
    Ok(())
}

#[tokio::test]
async fn band_dispatch_is_persisted() -> Result<(), Box<dyn Error>> {
    let (store, clock) = common::setup_store().await?;
    assert_eq!(store.last_dispatch(PriorityBand::NORMAL).await?, None);

    store
        .record_dispatch(PriorityBand::NORMAL, store.now())
        .await?;
    clock.advance(Duration::minutes(1));
    store
        .record_dispatch(PriorityBand::NORMAL, store.now())
        .await?;

    assert_eq!(
        store.last_dispatch(PriorityBand::NORMAL).await?,
        Some(common::epoch() + Duration::minutes(1))
    );
    assert_eq!(store.last_dispatch(PriorityBand::LOW).await?, None);
    Ok(())
}
