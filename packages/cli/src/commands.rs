//! Subcommand implementations.

use std::error::Error;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    ActorError, RunBudget, RunReport, SchedulingMode, StaleRecovery, StatsAggregator, Worker,
    start_supervisor,
};
use api::AppState;
use db::SurrealQueueStore;
use queue_core::{
    JobEvent, JobFilter, JobItem, JobStatus, NewJob, PoolLease, QueueError, QueueStore,
    StatsSnapshot, WorkerFilter, WorkerId, WorkerRecord, WorkerStatus, process_handle,
};
use tokio::sync::broadcast;

use crate::cli::{EnqueueArgs, PoolArgs, RunArgs};
use crate::config::AppConfig;
use crate::processors;

pub type CommandResult = Result<ExitCode, Box<dyn Error>>;

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const STOP_POLL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Loaded configuration plus an open store.
pub struct Context {
    pub config: AppConfig,
    pub store: Arc<SurrealQueueStore>,
}

impl Context {
    pub async fn open(config: AppConfig) -> Result<Self, db::DbError> {
        let db = db::init(&config.store).await?;
        let store = SurrealQueueStore::new(db).with_bands(config.engine.band_numbers());
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    fn shared_store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    fn stats(&self) -> StatsAggregator {
        StatsAggregator::new(self.shared_store(), &self.config.engine)
    }
}

pub async fn run(ctx: &Context, args: RunArgs, verbose: bool) -> CommandResult {
    let mode = if args.retry {
        SchedulingMode::Retry
    } else if let Some(band) = args.priority.as_deref() {
        SchedulingMode::SingleBand(ctx.config.engine.resolve_band(band)?)
    } else {
        SchedulingMode::Cascading
    };

    let mut budget = match args.budget {
        Some(secs) => RunBudget::default().with_max_duration(Duration::from_secs(secs)),
        None => RunBudget::until_idle(),
    };
    if let Some(limit) = args.limit {
        budget = budget.with_max_jobs(limit);
    }

    let mut worker = Worker::new(
        WorkerId::new(),
        ctx.shared_store(),
        Arc::new(processors::builtin()),
        &ctx.config.engine,
        mode,
    );

    let mut recovery = StaleRecovery::new(ctx.shared_store(), &ctx.config.engine);
    let printer = if verbose {
        let (tx, rx) = broadcast::channel(256);
        recovery = recovery.with_event_tx(tx.clone());
        worker = worker.with_event_tx(tx);
        Some(tokio::spawn(print_events(rx)))
    } else {
        None
    };

    // No pool may be running to clean up after a crashed run.
    let recovered = recovery.sweep().await;
    drop(recovery);

    worker.register(&process_handle("run"), None).await?;
    worker.set_status(WorkerStatus::Running).await?;
    let report = worker.run(budget).await;
    worker.deregister().await?;

    // Dropping the worker closes the event channel.
    drop(worker);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if !recovered.is_empty() {
        println!(
            "Recovered {} expired lock(s) and {} silent worker(s)",
            recovered.reclaimed,
            recovered.crashed.len()
        );
    }
    println!("{}", render_report(&report));
    Ok(ExitCode::SUCCESS)
}

async fn print_events(mut rx: broadcast::Receiver<JobEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!(
                "{} {}",
                event.timestamp().format("%H:%M:%S%.3f"),
                event.description()
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub async fn stats(ctx: &Context, json: bool) -> CommandResult {
    let snapshot = ctx.stats().snapshot().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{}", render_stats(&snapshot));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn dlq(ctx: &Context, limit: usize) -> CommandResult {
    let filter = JobFilter::default().with_status(JobStatus::DeadLetter);
    let total = ctx.store.count_jobs(&filter).await?;
    let jobs = ctx.store.query_page(&filter.with_limit(limit)).await?;

    if jobs.is_empty() {
        println!("Dead-letter queue is empty");
        return Ok(ExitCode::SUCCESS);
    }
    for job in &jobs {
        println!("{}", render_dead_letter(job));
    }
    let shown = jobs.len() as u64;
    if total > shown {
        println!("... and {} more", total - shown);
    }
    Ok(ExitCode::SUCCESS)
}

/// Run a worker pool in the foreground.
pub async fn start(ctx: &Context, args: PoolArgs) -> CommandResult {
    let workers = args
        .workers
        .unwrap_or(ctx.config.engine.supervisor.pool_size);
    if workers == 0 {
        return Err("--workers must be at least 1".into());
    }

    let owner = format!("jobq-{}", std::process::id());
    let mut supervisor = start_supervisor(
        owner,
        ctx.shared_store(),
        Arc::new(processors::builtin()),
        ctx.config.engine.clone(),
        SchedulingMode::Cascading,
    )
    .await?;

    match supervisor.start(workers).await {
        Ok(status) => {
            tracing::info!(owner = %status.owner, workers = status.target_size, "Worker pool started");
        }
        Err(ActorError::Queue(QueueError::PoolAlreadyRunning { owner })) => {
            eprintln!("A worker pool is already running (owner {})", owner);
            supervisor.shutdown().await?;
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            supervisor.shutdown().await?;
            return Err(e.into());
        }
    }

    let server = match ctx.config.http.bind.as_deref() {
        Some(bind) => {
            let addr: SocketAddr = bind.parse()?;
            let state = AppState::new(ctx.shared_store(), ctx.config.engine.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = api::serve(addr, state).await {
                    tracing::error!("Monitoring API stopped: {}", e);
                }
            }))
        }
        None => None,
    };

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            true
        }
        _ = supervisor.stopped() => false,
    };

    if interrupted {
        tracing::info!("Interrupted, draining worker pool");
        supervisor.stop().await?;
    } else {
        tracing::info!("Worker pool stopped on request");
    }
    supervisor.shutdown().await?;

    if let Some(server) = server {
        server.abort();
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn stop(ctx: &Context) -> CommandResult {
    Ok(exit_code(stop_pool(ctx).await?))
}

pub async fn restart(ctx: &Context, args: PoolArgs) -> CommandResult {
    if !stop_pool(ctx).await? {
        return Ok(ExitCode::FAILURE);
    }
    start(ctx, args).await
}

/// Ask the pool to stop and wait for its lease to go away. Returns false when
/// the pool did not stop in time.
async fn stop_pool(ctx: &Context) -> Result<bool, QueueError> {
    let Some(lease) = ctx.store.pool().await? else {
        println!("No worker pool is running");
        return Ok(true);
    };

    let supervisor = &ctx.config.engine.supervisor;
    if lease.is_stale(ctx.store.now(), supervisor.worker_ttl()) {
        ctx.store.release_pool(&lease.owner).await?;
        println!("Released abandoned worker pool lease held by {}", lease.owner);
        return Ok(true);
    }

    ctx.store.request_pool_stop().await?;
    println!("Stop requested for worker pool {}", lease.owner);

    let deadline = supervisor.heartbeat_interval() + supervisor.drain_timeout() + STOP_GRACE;
    match tokio::time::timeout(deadline, wait_for_release(ctx.store.as_ref(), &lease.owner)).await
    {
        Ok(result) => {
            result?;
            println!("Worker pool {} stopped", lease.owner);
            Ok(true)
        }
        Err(_) => {
            eprintln!(
                "Worker pool {} did not stop within {}s",
                lease.owner,
                deadline.as_secs()
            );
            Ok(false)
        }
    }
}

async fn wait_for_release(store: &dyn QueueStore, owner: &str) -> Result<(), QueueError> {
    loop {
        match store.pool().await? {
            Some(lease) if lease.owner == owner => tokio::time::sleep(STOP_POLL).await,
            _ => return Ok(()),
        }
    }
}

pub async fn status(ctx: &Context, json: bool) -> CommandResult {
    let pool = ctx.store.pool().await?;
    let workers = ctx.store.list_workers(&WorkerFilter::default()).await?;
    let snapshot = ctx.stats().snapshot().await?;

    if json {
        let body = serde_json::json!({
            "pool": pool,
            "workers": workers,
            "stats": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", render_pool(pool.as_ref()));
    if workers.is_empty() {
        println!("Workers: none");
    } else {
        println!("Workers:");
        for worker in &workers {
            println!("  {}", render_worker(worker));
        }
    }
    println!("{}", render_stats(&snapshot));
    Ok(ExitCode::SUCCESS)
}

pub async fn enqueue(ctx: &Context, args: EnqueueArgs) -> CommandResult {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| format!("--payload is not valid JSON: {}", e))?;

    let max_attempts = args
        .max_attempts
        .unwrap_or(ctx.config.engine.enqueue.default_max_attempts);
    let mut job = NewJob::new(args.processor, payload).with_max_attempts(max_attempts);
    if let Some(band) = args.priority.as_deref() {
        job = job.with_band(ctx.config.engine.resolve_band(band)?);
    }

    let id = ctx.store.enqueue(job).await?;
    println!("{}", id);
    Ok(ExitCode::SUCCESS)
}

pub async fn serve(ctx: &Context, bind: Option<String>) -> CommandResult {
    let bind = bind
        .or_else(|| ctx.config.http.bind.clone())
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind.parse()?;
    let state = AppState::new(ctx.shared_store(), ctx.config.engine.clone());

    tokio::select! {
        result = api::serve(addr, state) => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted, shutting down");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn render_report(report: &RunReport) -> String {
    format!(
        "Processed {} jobs in {}ms: {} completed, {} retrying, {} dead-lettered, {} conflicts, {} store errors",
        report.processed,
        report.elapsed_ms,
        report.completed,
        report.retried,
        report.dead_lettered,
        report.conflicts,
        report.store_errors
    )
}

fn render_stats(stats: &StatsSnapshot) -> String {
    let mut lines = vec![
        format!(
            "Jobs: {} pending, {} locked, {} awaiting retry, {} dead-letter, {} completed ({} today)",
            stats.pending,
            stats.locked,
            stats.retry_pending,
            stats.dead_letter,
            stats.completed,
            stats.completed_today
        ),
        match stats.oldest_pending_age_secs {
            Some(age) => format!("Oldest pending: {}s", age),
            None => "Oldest pending: -".to_string(),
        },
        format!(
            "Throughput: {:.2} jobs/min over the last {}s",
            stats.throughput_per_min, stats.throughput_window_secs
        ),
        format!(
            "Workers: {} live ({} running, {} starting, {} draining), {} crashed",
            stats.workers.live(),
            stats.workers.running,
            stats.workers.starting,
            stats.workers.draining,
            stats.workers.crashed
        ),
        "Bands:".to_string(),
    ];
    for band in &stats.bands {
        lines.push(format!(
            "  {:<8} ({}) {} pending, {} awaiting retry",
            band.name, band.band, band.pending, band.retry_pending
        ));
    }
    lines.join("\n")
}

fn render_dead_letter(job: &JobItem) -> String {
    let at = job
        .dead_lettered_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {}  band {}  attempts {}/{}  {}  {}",
        job.id,
        job.processor_key,
        job.priority_band,
        job.attempt_count,
        job.max_attempts,
        at,
        job.last_error.as_deref().unwrap_or("-")
    )
}

fn render_pool(pool: Option<&PoolLease>) -> String {
    match pool {
        None => "Pool: not running".to_string(),
        Some(lease) => format!(
            "Pool: {} ({} workers, started {}, last heartbeat {}{})",
            lease.owner,
            lease.size,
            lease.started_at.to_rfc3339(),
            lease.heartbeat_at.to_rfc3339(),
            if lease.stop_requested { ", stop requested" } else { "" }
        ),
    }
}

fn render_worker(worker: &WorkerRecord) -> String {
    let current = worker
        .current_job_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<8}  {}  processed {}  current {}  heartbeat {}",
        worker.worker_id,
        worker.status.as_str(),
        worker.process_handle,
        worker.processed_count,
        current,
        worker.last_heartbeat_at.to_rfc3339()
    )
}
