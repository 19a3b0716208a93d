use std::net::SocketAddr;
use std::sync::Arc;

use actors::StatsAggregator;
use axum::{Router, routing::get};
use queue_core::{EngineConfig, QueueStore};

use crate::jobs::{get_job, list_dead_letters, list_jobs};
use crate::monitoring::{get_stats, health_check, list_workers};

/// Shared state for the monitoring handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QueueStore>,
    pub stats: StatsAggregator,
    pub config: Arc<EngineConfig>,
}

impl AppState {
    pub fn new(store: Arc<dyn QueueStore>, config: EngineConfig) -> Self {
        Self {
            stats: StatsAggregator::new(store.clone(), &config),
            store,
            config: Arc::new(config),
        }
    }
}

/// Build the monitoring router. Every route is a GET.
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/workers", get(list_workers))
        .route("/api/dlq", get(list_dead_letters))
        .with_state(state)
}

/// Serve the monitoring API until the task is cancelled.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Monitoring API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_routes(state)).await
}
