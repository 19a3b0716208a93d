//! Health, statistics and worker handlers.

use std::str::FromStr;

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, Utc};
use queue_core::{PoolLease, StatsSnapshot, WorkerFilter, WorkerRecord, WorkerStatus};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::jobs::{Page, PageParams};
use crate::routes::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: DateTime<Utc>,
    /// The running worker pool, if any.
    pub pool: Option<PoolLease>,
}

/// Query parameters for `/api/workers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Liveness plus a store round trip.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let pool = state.store.pool().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        time: state.store.now(),
        pool,
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsSnapshot>> {
    Ok(Json(state.stats.snapshot().await?))
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<WorkerListParams>,
) -> ApiResult<Json<Page<WorkerRecord>>> {
    let mut filter = WorkerFilter::default();
    if let Some(status) = params.status.as_deref().filter(|s| !s.is_empty()) {
        let status = WorkerStatus::from_str(status)
            .map_err(|_| ApiError::BadRequest(format!("Unknown worker status: {}", status)))?;
        filter = filter.with_status(status);
    }

    let page = PageParams {
        limit: params.limit,
        offset: params.offset,
    };
    let (limit, offset) = (page.limit(), page.offset());

    let total = state.store.list_workers(&filter).await?.len() as u64;
    filter.limit = Some(limit);
    filter.offset = Some(offset);
    let items = state.store.list_workers(&filter).await?;

    Ok(Json(Page {
        items,
        total,
        limit,
        offset,
    }))
}
