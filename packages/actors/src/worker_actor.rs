//! Worker actor driving a [`Worker`] from its mailbox.

use queue_core::{WorkerStatus, process_handle};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::messages::WorkerMessage;
use crate::worker::{CycleOutcome, Worker};

/// State for the worker actor.
pub struct WorkerActorState {
    pub worker: Worker,
    /// Retire after this many completed jobs.
    pub recycle_after: Option<u64>,
    pub draining: bool,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker: Worker,
    pub pool_owner: String,
    pub recycle_after: Option<u64>,
}

/// Reason a worker gives when it retires after its job allowance.
pub const RECYCLED: &str = "recycled";

/// Reason a worker gives after a drain request.
pub const DRAINED: &str = "drained";

/// Worker actor that polls the store for jobs.
///
/// Each `Poll` runs exactly one cycle, so a `Drain` queued behind it is
/// handled only after the current job has been settled.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let name = myself
            .get_name()
            .unwrap_or_else(|| args.worker.id().to_string());
        tracing::info!(worker_id = %args.worker.id(), "Starting worker: {}", name);

        args.worker
            .register(&process_handle(&name), Some(&args.pool_owner))
            .await?;

        Ok(WorkerActorState {
            worker: args.worker,
            recycle_after: args.recycle_after,
            draining: false,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.worker.set_status(WorkerStatus::Running).await?;
        myself.send_message(WorkerMessage::Poll)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if state.draining {
                    return Ok(());
                }

                let outcome = state.worker.cycle().await;

                if state
                    .recycle_after
                    .is_some_and(|max| state.worker.processed_count() >= max)
                {
                    tracing::info!(
                        worker_id = %state.worker.id(),
                        processed = state.worker.processed_count(),
                        "Worker reached its job allowance"
                    );
                    myself.stop(Some(RECYCLED.to_string()));
                    return Ok(());
                }

                match outcome {
                    CycleOutcome::Idle => {
                        myself.send_after(state.worker.poll_interval(), || WorkerMessage::Poll);
                    }
                    CycleOutcome::StoreError(_) => {
                        myself.send_after(state.worker.store_backoff(), || WorkerMessage::Poll);
                    }
                    _ => myself.send_message(WorkerMessage::Poll)?,
                }
            }

            WorkerMessage::Drain => {
                tracing::info!(worker_id = %state.worker.id(), "Draining worker");
                state.draining = true;
                if let Err(e) = state.worker.set_status(WorkerStatus::Draining).await {
                    tracing::warn!(worker_id = %state.worker.id(), "Failed to mark draining: {}", e);
                }
                myself.stop(Some(DRAINED.to_string()));
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Err(e) = state.worker.deregister().await {
            tracing::warn!(worker_id = %state.worker.id(), "Failed to deregister worker: {}", e);
        }
        tracing::info!(
            worker_id = %state.worker.id(),
            processed = state.worker.processed_count(),
            "Worker stopped"
        );
        Ok(())
    }
}
