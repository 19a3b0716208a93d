use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use queue_core::ManualClock;

use db::{DbConfig, DbError, SurrealQueueStore};

/// Fixed start so millisecond storage never truncates test timestamps.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_735_689_600_000)
        .single()
        .unwrap_or_default()
}

/// Fresh in-memory store driven by a manual clock.
pub async fn setup_store() -> Result<(SurrealQueueStore, Arc<ManualClock>), DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SurrealQueueStore::new(db).with_clock(clock.clone());
    Ok((store, clock))
}
