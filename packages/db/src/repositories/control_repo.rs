//! Pool lease and band dispatch bookkeeping.

use chrono::{DateTime, Utc};
use queue_core::{PoolLease, PriorityBand};
use serde_json::json;

use super::{Bindings, fetch};
use crate::records::{DispatchRow, PoolRow};
use crate::{Database, DbError};

const POOL_KEY: &str = "main";

/// Repository for cross-process control records.
#[derive(Clone)]
pub struct ControlRepository {
    db: Database,
}

impl ControlRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn pool(&self) -> Result<Option<PoolLease>, DbError> {
        let record: Option<PoolRow> = self.db.select(("pool", POOL_KEY)).await?;
        Ok(record.map(PoolLease::from))
    }

    /// Create the lease record. Fails if one already exists.
    pub async fn create_pool(&self, lease: &PoolLease) -> Result<Option<PoolLease>, DbError> {
        let created: Option<PoolRow> = self
            .db
            .create(("pool", POOL_KEY))
            .content(pool_row(lease))
            .await?;
        Ok(created.map(PoolLease::from))
    }

    /// Replace the lease if its holder went quiet before `cutoff` or is `lease.owner` itself.
    pub async fn take_over_pool(
        &self,
        lease: &PoolLease,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<PoolLease>, DbError> {
        let query = r#"
            UPDATE type::thing('pool', $key)
            SET owner = $owner, size = $size, started_at = $now, heartbeat_at = $now,
                stop_requested = false
            WHERE heartbeat_at < $cutoff OR owner = $owner
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("key", json!(POOL_KEY)),
            ("owner", json!(lease.owner)),
            ("size", json!(lease.size)),
            ("now", json!(lease.started_at.timestamp_millis())),
            ("cutoff", json!(cutoff.timestamp_millis())),
        ];
        first_pool(fetch(&self.db, query.to_string(), bindings).await?)
    }

    pub async fn renew_pool(
        &self,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PoolLease>, DbError> {
        let query = r#"
            UPDATE type::thing('pool', $key)
            SET heartbeat_at = $now
            WHERE owner = $owner
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![
            ("key", json!(POOL_KEY)),
            ("owner", json!(owner)),
            ("now", json!(now.timestamp_millis())),
        ];
        first_pool(fetch(&self.db, query.to_string(), bindings).await?)
    }

    /// Flag the lease for shutdown. `None` when no lease exists.
    pub async fn request_stop(&self) -> Result<Option<PoolLease>, DbError> {
        let query = r#"
            UPDATE type::thing('pool', $key)
            SET stop_requested = true
            RETURN AFTER
        "#;
        let bindings: Bindings = vec![("key", json!(POOL_KEY))];
        first_pool(fetch(&self.db, query.to_string(), bindings).await?)
    }

    pub async fn delete_pool(&self, owner: &str) -> Result<(), DbError> {
        let query = r#"
            DELETE type::thing('pool', $key) WHERE owner = $owner
        "#;
        let bindings: Bindings = vec![("key", json!(POOL_KEY)), ("owner", json!(owner))];
        let mut q = self.db.query(query);
        for binding in bindings {
            q = q.bind(binding);
        }
        q.await?.check()?;
        Ok(())
    }

    pub async fn last_dispatch(
        &self,
        band: PriorityBand,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let query = r#"
            SELECT band, last_dispatch_at FROM type::thing('band_dispatch', $key)
        "#;
        let bindings: Bindings = vec![("key", json!(dispatch_key(band)))];
        let rows: Vec<DispatchRow> = fetch(&self.db, query.to_string(), bindings).await?;
        Ok(rows.first().map(|r| r.last_dispatch_at))
    }

    pub async fn record_dispatch(
        &self,
        band: PriorityBand,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let query = r#"
            UPSERT type::thing('band_dispatch', $key)
            SET band = $band, last_dispatch_at = $at
        "#;
        let bindings: Bindings = vec![
            ("key", json!(dispatch_key(band))),
            ("band", json!(band.value())),
            ("at", json!(at.timestamp_millis())),
        ];
        let _: Vec<DispatchRow> = fetch(&self.db, query.to_string(), bindings).await?;
        Ok(())
    }
}

fn dispatch_key(band: PriorityBand) -> String {
    format!("band{}", band.value())
}

fn pool_row(lease: &PoolLease) -> PoolRow {
    PoolRow {
        id: None,
        owner: lease.owner.clone(),
        size: lease.size,
        started_at: lease.started_at,
        heartbeat_at: lease.heartbeat_at,
        stop_requested: lease.stop_requested,
    }
}

fn first_pool(rows: Vec<PoolRow>) -> Result<Option<PoolLease>, DbError> {
    Ok(rows.into_iter().next().map(PoolLease::from))
}
