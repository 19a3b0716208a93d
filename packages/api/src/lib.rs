//! Read-only monitoring API for the job queue.
//!
//! This crate exposes queue state over HTTP:
//! - Health and aggregate statistics
//! - Job listings, single jobs and the dead-letter queue
//! - Worker records
//!
//! Nothing here mutates the queue.

mod error;
mod jobs;
mod monitoring;
mod routes;

pub use error::{ApiError, ApiResult};
pub use jobs::{JobListParams, Page, PageParams};
pub use monitoring::{HealthResponse, WorkerListParams};
pub use routes::{AppState, create_routes, serve};
