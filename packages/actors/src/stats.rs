//! Derived queue statistics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use queue_core::{
    BandConfig, BandDepth, EngineConfig, JobFilter, JobStatus, PriorityBand, QueueResult,
    QueueStore, StatsSnapshot, WorkerCounts, WorkerFilter,
};

/// Builds [`StatsSnapshot`]s from independent store reads.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn QueueStore>,
    bands: Vec<BandConfig>,
    window: Duration,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn QueueStore>, config: &EngineConfig) -> Self {
        let mut bands = config.bands.clone();
        bands.sort_by_key(|b| b.band);
        Self {
            store,
            bands,
            window: Duration::seconds(config.stats.throughput_window_secs.max(1) as i64),
        }
    }

    pub async fn snapshot(&self) -> QueueResult<StatsSnapshot> {
        let now = self.store.now();
        let counts = self.store.count_by_status_band().await?;

        let mut depths: BTreeMap<PriorityBand, BandDepth> = self
            .bands
            .iter()
            .map(|b| (b.band, depth(b.band, b.name.clone())))
            .collect();
        let mut totals: HashMap<JobStatus, u64> = HashMap::new();

        for row in counts {
            *totals.entry(row.status).or_default() += row.count;
            let slot = depths.entry(row.band).or_insert_with(|| {
                let name = row
                    .band
                    .default_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("band {}", row.band));
                depth(row.band, name)
            });
            match row.status {
                JobStatus::Pending => slot.pending += row.count,
                JobStatus::RetryPending => slot.retry_pending += row.count,
                _ => {}
            }
        }
        let total = |status: JobStatus| totals.get(&status).copied().unwrap_or(0);

        let completed_today = self
            .store
            .count_jobs(
                &JobFilter::default()
                    .with_status(JobStatus::Completed)
                    .completed_after(start_of_day(now)),
            )
            .await?;

        let completed_in_window = self
            .store
            .count_jobs(
                &JobFilter::default()
                    .with_status(JobStatus::Completed)
                    .completed_after(now - self.window),
            )
            .await?;
        let window_minutes = self.window.num_seconds() as f64 / 60.0;

        let oldest_pending_age_secs = self
            .store
            .oldest_created_at(JobStatus::Pending)
            .await?
            .map(|created| (now - created).num_seconds().max(0));

        let mut workers = WorkerCounts::default();
        for record in self.store.list_workers(&WorkerFilter::default()).await? {
            workers.add(record.status);
        }

        Ok(StatsSnapshot {
            generated_at: now,
            bands: depths.into_values().collect(),
            pending: total(JobStatus::Pending),
            locked: total(JobStatus::Locked),
            retry_pending: total(JobStatus::RetryPending),
            dead_letter: total(JobStatus::DeadLetter),
            completed: total(JobStatus::Completed),
            completed_today,
            oldest_pending_age_secs,
            throughput_per_min: completed_in_window as f64 / window_minutes,
            throughput_window_secs: self.window.num_seconds() as u64,
            workers,
        })
    }
}

fn depth(band: PriorityBand, name: String) -> BandDepth {
    BandDepth {
        band,
        name,
        pending: 0,
        retry_pending: 0,
    }
}

/// UTC midnight of the day containing `now`.
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
