//! Job listing handlers.

use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use queue_core::{JobFilter, JobId, JobItem, JobStatus};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches across all pages.
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

/// Paging parameters shared by listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageParams {
    pub(crate) fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// Query parameters for `/api/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListParams {
    pub status: Option<String>,
    /// Band number or configured band name.
    pub band: Option<String>,
    pub processor: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobListParams {
    fn page(&self) -> PageParams {
        PageParams {
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// List jobs, oldest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Json<Page<JobItem>>> {
    let mut filter = JobFilter::default();

    if let Some(status) = params.status.as_deref().filter(|s| !s.is_empty()) {
        let status = JobStatus::from_str(status)
            .map_err(|_| ApiError::BadRequest(format!("Unknown job status: {}", status)))?;
        filter = filter.with_status(status);
    }

    if let Some(band) = params.band.as_deref().filter(|s| !s.is_empty()) {
        let band = state
            .config
            .resolve_band(band)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        filter = filter.with_band(band);
    }

    if let Some(processor) = params.processor.as_deref().filter(|s| !s.is_empty()) {
        filter = filter.with_processor(processor);
    }

    page(&state, filter, &params.page()).await.map(Json)
}

/// Get a job by ID.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobItem>> {
    let job_id = JobId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid job ID: {}", e)))?;
    let job = state.store.get(job_id).await?;
    Ok(Json(job))
}

/// List dead-letter jobs.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<Page<JobItem>>> {
    let filter = JobFilter::default().with_status(JobStatus::DeadLetter);
    page(&state, filter, &params).await.map(Json)
}

async fn page(state: &AppState, filter: JobFilter, params: &PageParams) -> ApiResult<Page<JobItem>> {
    let limit = params.limit();
    let offset = params.offset();

    let total = state.store.count_jobs(&filter).await?;
    let items = state
        .store
        .query_page(&filter.with_limit(limit).with_offset(offset))
        .await?;

    Ok(Page {
        items,
        total,
        limit,
        offset,
    })
}
