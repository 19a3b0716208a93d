//! Band selection for claims.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use queue_core::{
    BandConfig, ClaimFilter, ClaimOrder, EngineConfig, JobItem, PriorityBand, QueueResult,
    QueueStore, WorkerId,
};

/// Which jobs a worker competes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// One band only, never throttled.
    SingleBand(PriorityBand),
    /// Every configured band, lowest number first, subject to band intervals.
    #[default]
    Cascading,
    /// Due retries only, across all bands.
    Retry,
}

impl std::fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingMode::SingleBand(band) => write!(f, "band {}", band),
            SchedulingMode::Cascading => write!(f, "cascading"),
            SchedulingMode::Retry => write!(f, "retry"),
        }
    }
}

/// Turns a [`SchedulingMode`] into claim filters.
///
/// Band throttling state lives in the store so repeated one-shot runs
/// honour each band's minimum interval.
///
/// A throttled band that gets dispatched opens a window: it keeps
/// draining its backlog until it runs dry or its interval has passed
/// since the window opened. Every dispatch is recorded, so once the
/// window closes the band waits a full interval after its last dispatch.
pub struct PriorityScheduler {
    store: Arc<dyn QueueStore>,
    bands: Vec<BandConfig>,
    retry_order: ClaimOrder,
    mode: SchedulingMode,
    /// Open dispatch windows and when each opened.
    opened: HashMap<PriorityBand, DateTime<Utc>>,
}

impl PriorityScheduler {
    pub fn new(store: Arc<dyn QueueStore>, config: &EngineConfig, mode: SchedulingMode) -> Self {
        let mut bands = config.bands.clone();
        bands.sort_by_key(|b| b.band);

        let retry_order = if config.scheduler.retry_band_ordering {
            ClaimOrder::BandFirst
        } else {
            ClaimOrder::DueFirst
        };

        Self {
            store,
            bands,
            retry_order,
            mode,
            opened: HashMap::new(),
        }
    }

    pub fn mode(&self) -> SchedulingMode {
        self.mode
    }

    /// Whether `band` is inside an open window at `now`.
    fn window_open(&self, config: &BandConfig, now: DateTime<Utc>) -> bool {
        match (self.opened.get(&config.band), config.min_interval()) {
            (Some(opened_at), Some(interval)) => now - *opened_at < interval,
            _ => false,
        }
    }

    /// Bands a claim may currently take from, in ascending order.
    pub async fn eligible_bands(&self) -> QueueResult<Vec<PriorityBand>> {
        match self.mode {
            SchedulingMode::SingleBand(band) => Ok(vec![band]),
            SchedulingMode::Retry => Ok(self.bands.iter().map(|b| b.band).collect()),
            SchedulingMode::Cascading => {
                let now = self.store.now();
                let mut eligible = Vec::with_capacity(self.bands.len());

                for config in &self.bands {
                    let open = match config.min_interval() {
                        None => true,
                        Some(_) if self.window_open(config, now) => true,
                        Some(interval) => match self.store.last_dispatch(config.band).await? {
                            None => true,
                            Some(last) => now - last >= interval,
                        },
                    };

                    if open {
                        eligible.push(config.band);
                    } else {
                        tracing::trace!(band = %config.band, "Band throttled");
                    }
                }

                Ok(eligible)
            }
        }
    }

    /// The filter for the next claim.
    pub async fn filter(&self) -> QueueResult<ClaimFilter> {
        let bands = self.eligible_bands().await?;
        Ok(match self.mode {
            SchedulingMode::Retry => ClaimFilter::retries(bands, self.retry_order),
            _ => ClaimFilter::new(bands),
        })
    }

    /// Claim the next job for `worker_id` under the current mode.
    pub async fn claim_next(&mut self, worker_id: &WorkerId) -> QueueResult<Option<JobItem>> {
        let now = self.store.now();
        let bands = &self.bands;
        self.opened.retain(|band, opened_at| {
            bands
                .iter()
                .find(|b| b.band == *band)
                .and_then(BandConfig::min_interval)
                .is_some_and(|interval| now - *opened_at < interval)
        });

        let filter = self.filter().await?;
        let claimed = self.store.claim_next(&filter, worker_id).await?;

        match &claimed {
            // Nothing eligible anywhere, so every window has run dry.
            None => self.opened.clear(),
            Some(job) => {
                // Bands ahead of the claimed one had nothing eligible.
                self.opened.retain(|band, _| *band >= job.priority_band);
                if self.mode != SchedulingMode::Retry {
                    self.opened.entry(job.priority_band).or_insert(now);
                    self.store.record_dispatch(job.priority_band, now).await?;
                }
            }
        }

        Ok(claimed)
    }
}
