//! Repository implementations for database operations.

mod control_repo;
mod job_repo;
mod worker_repo;

use serde::de::DeserializeOwned;

use crate::{Database, DbError};

pub use control_repo::ControlRepository;
pub use job_repo::{JobRepository, Release};
pub use worker_repo::WorkerRepository;

/// Named query parameters.
pub(crate) type Bindings = Vec<(&'static str, serde_json::Value)>;

/// Run a single-statement query and take its result set.
pub(crate) async fn fetch<T>(db: &Database, query: String, bindings: Bindings) -> Result<Vec<T>, DbError>
where
    T: DeserializeOwned,
{
    let mut result = db.query(query);

    for binding in bindings {
        result = result.bind(binding);
    }

    let mut response = result.await?;
    let rows: Vec<T> = response.take(0)?;
    Ok(rows)
}
