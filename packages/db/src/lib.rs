//! SurrealDB integration for the job queue.
//!
//! This crate provides database connectivity, repositories and the
//! `SurrealQueueStore` implementation of `queue_core::QueueStore`.
//!
//! # Features
//!
//! - `memory` (default): In-memory storage (`mem://`), one datastore per connection
//! - `remote` (default): Shared SurrealDB server over `ws://` for multi-process setups
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod records;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;
pub use store::SurrealQueueStore;

/// Connect with the given configuration and make sure the schema exists.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
