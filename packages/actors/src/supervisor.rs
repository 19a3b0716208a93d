//! Supervisor actor owning the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use queue_core::{
    EngineConfig, JobEvent, QueueError, QueueStore, WorkerFilter, WorkerId, WorkerStatus,
};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::messages::{
    ActorError, ActorResult, HealthReport, PoolStatus, SupervisorMessage, WorkerMessage,
};
use crate::processor::ProcessorRegistry;
use crate::recovery::StaleRecovery;
use crate::scheduler::SchedulingMode;
use crate::worker::Worker;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Grace period for a killed worker to unwind.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct WorkerSlot {
    worker_id: WorkerId,
    actor: ActorRef<WorkerMessage>,
    handle: JoinHandle<()>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    owner: String,
    store: Arc<dyn QueueStore>,
    processors: Arc<ProcessorRegistry>,
    config: EngineConfig,
    mode: SchedulingMode,
    /// Event broadcaster.
    event_tx: broadcast::Sender<JobEvent>,
    recovery: StaleRecovery,
    running: bool,
    target_size: u32,
    workers: HashMap<ActorId, WorkerSlot>,
    /// Worker counter for unique actor names.
    worker_counter: u64,
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub owner: String,
    pub store: Arc<dyn QueueStore>,
    pub processors: Arc<ProcessorRegistry>,
    pub config: EngineConfig,
    pub mode: SchedulingMode,
    pub event_tx: broadcast::Sender<JobEvent>,
}

impl SupervisorState {
    fn new(args: SupervisorArgs) -> Self {
        let recovery = StaleRecovery::new(args.store.clone(), &args.config)
            .with_event_tx(args.event_tx.clone());
        Self {
            owner: args.owner,
            store: args.store,
            processors: args.processors,
            config: args.config,
            mode: args.mode,
            event_tx: args.event_tx,
            recovery,
            running: false,
            target_size: 0,
            workers: HashMap::new(),
            worker_counter: 0,
        }
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn spawn_worker(
        &mut self,
        myself: &ActorRef<SupervisorMessage>,
    ) -> Result<(), ActorProcessingErr> {
        self.worker_counter += 1;
        let name = format!("{}-worker-{}", self.owner, self.worker_counter);
        let worker = Worker::new(
            WorkerId::new(),
            self.store.clone(),
            self.processors.clone(),
            &self.config,
            self.mode,
        )
        .with_event_tx(self.event_tx.clone());
        let worker_id = worker.id().clone();

        let args = WorkerArgs {
            worker,
            pool_owner: self.owner.clone(),
            recycle_after: self.config.worker.max_jobs_per_worker,
        };

        let (actor, handle) = Actor::spawn_linked(Some(name), WorkerActor, args, myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

        self.workers.insert(
            actor.get_id(),
            WorkerSlot {
                worker_id,
                actor,
                handle,
            },
        );
        Ok(())
    }

    /// Spawn workers until the pool is back at its target size.
    async fn top_up(&mut self, myself: &ActorRef<SupervisorMessage>) -> usize {
        let mut spawned = 0;
        while self.running && self.workers.len() < self.target_size as usize {
            if let Err(e) = self.spawn_worker(myself).await {
                tracing::error!(owner = %self.owner, "{}", e);
                break;
            }
            spawned += 1;
        }
        spawned
    }

    async fn start(
        &mut self,
        myself: &ActorRef<SupervisorMessage>,
        workers: u32,
    ) -> Result<PoolStatus, QueueError> {
        if self.running {
            return Err(QueueError::PoolAlreadyRunning {
                owner: self.owner.clone(),
            });
        }

        self.store
            .acquire_pool(&self.owner, workers, self.config.supervisor.worker_ttl())
            .await?;

        self.running = true;
        self.target_size = workers;
        let spawned = self.top_up(myself).await;
        tracing::info!(owner = %self.owner, workers = spawned, mode = %self.mode, "Worker pool started");

        self.status().await
    }

    /// Drain every worker, kill the ones that overrun, release the lease.
    async fn stop(&mut self) -> Result<(), QueueError> {
        if !self.running && self.workers.is_empty() {
            return Ok(());
        }
        self.running = false;
        tracing::info!(owner = %self.owner, workers = self.workers.len(), "Stopping worker pool");

        for slot in self.workers.values() {
            let _ = slot.actor.send_message(WorkerMessage::Drain);
        }

        let started = Instant::now();
        let drain_timeout = self.config.supervisor.drain_timeout();
        let slots: Vec<WorkerSlot> = self.workers.drain().map(|(_, slot)| slot).collect();

        for mut slot in slots {
            let remaining = drain_timeout.saturating_sub(started.elapsed());
            if tokio::time::timeout(remaining, &mut slot.handle).await.is_ok() {
                continue;
            }

            tracing::warn!(worker_id = %slot.worker_id, "Worker did not drain in time, killing");
            slot.actor.kill();
            let _ = tokio::time::timeout(KILL_GRACE, &mut slot.handle).await;
            self.retire(&slot.worker_id, WorkerStatus::Stopped).await;
        }

        self.store.release_pool(&self.owner).await?;
        tracing::info!(owner = %self.owner, "Worker pool stopped");
        Ok(())
    }

    /// Settle the store state of a worker that can no longer do it itself.
    async fn retire(&self, worker_id: &WorkerId, status: WorkerStatus) {
        self.recovery.retire(worker_id, status).await;
    }

    async fn status(&self) -> Result<PoolStatus, QueueError> {
        let workers = self
            .store
            .list_workers(&WorkerFilter::default().with_pool_owner(self.owner.clone()))
            .await?;
        let processed_total = workers.iter().map(|w| w.processed_count).sum();

        Ok(PoolStatus {
            owner: self.owner.clone(),
            running: self.running,
            target_size: self.target_size,
            live_workers: self.workers.len(),
            workers,
            processed_total,
        })
    }

    async fn check_health(&mut self, myself: &ActorRef<SupervisorMessage>) -> HealthReport {
        let recovered = self.recovery.sweep().await;
        let mut report = HealthReport {
            reclaimed: recovered.reclaimed,
            ..HealthReport::default()
        };

        for worker_id in recovered.crashed {
            let own = self
                .workers
                .iter()
                .find(|(_, slot)| slot.worker_id == worker_id)
                .map(|(id, _)| *id);
            if let Some(actor_id) = own
                && let Some(slot) = self.workers.remove(&actor_id)
            {
                slot.actor.kill();
            }
            report.crashed.push(worker_id);
        }

        if self.running {
            match self.store.renew_pool(&self.owner).await {
                Ok(lease) if lease.stop_requested => {
                    tracing::info!(owner = %self.owner, "Stop requested through the store");
                    report.stop_requested = true;
                }
                Ok(_) => {}
                Err(QueueError::NotFound(_)) => {
                    tracing::warn!(owner = %self.owner, "Pool lease lost, reacquiring");
                    if let Err(e) = self
                        .store
                        .acquire_pool(&self.owner, self.target_size, self.config.supervisor.worker_ttl())
                        .await
                    {
                        tracing::error!(owner = %self.owner, "Failed to reacquire pool lease: {}", e);
                    }
                }
                Err(e) => tracing::warn!(owner = %self.owner, "Lease renewal failed: {}", e),
            }
        }

        if report.stop_requested {
            if let Err(e) = self.stop().await {
                tracing::error!(owner = %self.owner, "Failed to stop pool: {}", e);
            }
            myself.stop(Some("stop requested".to_string()));
        } else {
            report.replaced = self.top_up(myself).await;
        }

        report
    }
}

/// Supervisor actor that keeps the worker pool at its target size.
pub struct WorkerSupervisor;

impl Actor for WorkerSupervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(owner = %args.owner, "Starting worker supervisor");

        // Start periodic tick
        let interval_period = args
            .config
            .supervisor
            .heartbeat_interval()
            .max(Duration::from_millis(10));
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SupervisorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Start { workers, reply } => {
                let _ = reply.send(state.start(&myself, workers).await);
            }

            SupervisorMessage::Stop { reply } => {
                let _ = reply.send(state.stop().await);
            }

            SupervisorMessage::Status { reply } => {
                let _ = reply.send(state.status().await);
            }

            SupervisorMessage::CheckHealth { reply } => {
                let _ = reply.send(state.check_health(&myself).await);
            }

            SupervisorMessage::Tick => {
                let report = state.check_health(&myself).await;
                if report.reclaimed > 0 || !report.crashed.is_empty() || report.replaced > 0 {
                    tracing::info!(
                        owner = %state.owner,
                        reclaimed = report.reclaimed,
                        crashed = report.crashed.len(),
                        replaced = report.replaced,
                        "Health check"
                    );
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Err(e) = state.stop().await {
            tracing::error!(owner = %state.owner, "Failed to stop pool on shutdown: {}", e);
        }
        tracing::info!(owner = %state.owner, "Worker supervisor stopped");
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if let Some(slot) = state.workers.remove(&cell.get_id()) {
                    tracing::info!(worker_id = %slot.worker_id, "Worker exited: {:?}", reason);
                    state.top_up(&myself).await;
                }
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                if let Some(slot) = state.workers.remove(&cell.get_id()) {
                    tracing::error!(worker_id = %slot.worker_id, "Worker failed: {}", error);
                    state.retire(&slot.worker_id, WorkerStatus::Crashed).await;
                    state.emit(JobEvent::WorkerCrashed {
                        worker_id: slot.worker_id,
                        reason: error.to_string(),
                        timestamp: state.store.now(),
                    });
                    state.top_up(&myself).await;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Client side of a running [`WorkerSupervisor`].
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMessage>,
    handle: Option<JoinHandle<()>>,
    owner: String,
    event_tx: broadcast::Sender<JobEvent>,
}

impl SupervisorHandle {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Subscribe to job and worker events from every worker in the pool.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub async fn start(&self, workers: u32) -> ActorResult<PoolStatus> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.send(SupervisorMessage::Start {
            workers,
            reply: tx.into(),
        })?;
        Ok(self.receive(rx).await??)
    }

    pub async fn stop(&self) -> ActorResult<()> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.send(SupervisorMessage::Stop { reply: tx.into() })?;
        Ok(self.receive(rx).await??)
    }

    pub async fn restart(&self, workers: u32) -> ActorResult<PoolStatus> {
        self.stop().await?;
        self.start(workers).await
    }

    pub async fn status(&self) -> ActorResult<PoolStatus> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.send(SupervisorMessage::Status { reply: tx.into() })?;
        Ok(self.receive(rx).await??)
    }

    pub async fn check_health(&self) -> ActorResult<HealthReport> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.send(SupervisorMessage::CheckHealth { reply: tx.into() })?;
        self.receive(rx).await
    }

    /// Wait until the supervisor stops on its own.
    pub async fn stopped(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
    }

    /// Stop the pool and the supervisor actor.
    pub async fn shutdown(mut self) -> ActorResult<()> {
        if let Some(handle) = self.handle.take()
            && !handle.is_finished()
        {
            self.actor.stop(Some("shutdown".to_string()));
            handle
                .await
                .map_err(|e| ActorError::Actor(format!("Supervisor task failed: {}", e)))?;
        }
        Ok(())
    }

    fn send(&self, message: SupervisorMessage) -> ActorResult<()> {
        self.actor
            .send_message(message)
            .map_err(|e| ActorError::Actor(format!("Supervisor unavailable: {}", e)))
    }

    async fn receive<T>(&self, rx: ractor::concurrency::OneshotReceiver<T>) -> ActorResult<T> {
        rx.await
            .map_err(|_| ActorError::Actor("Supervisor dropped the reply".into()))
    }
}

/// Start a supervisor for a pool owned by `owner`. No workers run until
/// [`SupervisorHandle::start`] is called.
pub async fn start_supervisor(
    owner: impl Into<String>,
    store: Arc<dyn QueueStore>,
    processors: Arc<ProcessorRegistry>,
    config: EngineConfig,
    mode: SchedulingMode,
) -> ActorResult<SupervisorHandle> {
    let owner = owner.into();
    let (event_tx, _) = broadcast::channel(1024);
    let args = SupervisorArgs {
        owner: owner.clone(),
        store,
        processors,
        config,
        mode,
        event_tx: event_tx.clone(),
    };

    let (actor, handle) =
        Actor::spawn(Some(format!("{}-supervisor", owner)), WorkerSupervisor, args).await?;

    Ok(SupervisorHandle {
        actor,
        handle: Some(handle),
        owner,
        event_tx,
    })
}
