//! Database schema definitions using SurrealQL.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch so that
//! range comparisons behave the same on every backend.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes. Safe to run repeatedly.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(WORKER_SCHEMA).await?.check()?;
    db.query(CONTROL_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

-- Claim path: eligible jobs by band, FIFO inside a band
DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_claim ON job FIELDS status, priority_band, created_at;
DEFINE INDEX IF NOT EXISTS job_eligible ON job FIELDS status, next_eligible_at;
DEFINE INDEX IF NOT EXISTS job_locked ON job FIELDS locked_by;
DEFINE INDEX IF NOT EXISTS job_completed ON job FIELDS completed_at;
"#;

/// Worker record table schema.
const WORKER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS worker SCHEMALESS;

DEFINE INDEX IF NOT EXISTS worker_status ON worker FIELDS status;
DEFINE INDEX IF NOT EXISTS worker_pool ON worker FIELDS pool_owner;
"#;

/// Band dispatch timestamps and the worker pool lease.
const CONTROL_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS band_dispatch SCHEMALESS;
DEFINE TABLE IF NOT EXISTS pool SCHEMALESS;
"#;
