//! Engine configuration with defaults for every knob.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::PriorityBand;
use crate::retry::RetryConfig;

/// One configured priority band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandConfig {
    pub band: PriorityBand,
    pub name: String,
    /// Minimum seconds between two dispatch sessions of this band. `0` disables throttling.
    #[serde(default)]
    pub min_interval_secs: u64,
}

impl BandConfig {
    pub fn new(band: PriorityBand, name: impl Into<String>, min_interval_secs: u64) -> Self {
        Self {
            band,
            name: name.into(),
            min_interval_secs,
        }
    }

    pub fn min_interval(&self) -> Option<chrono::Duration> {
        (self.min_interval_secs > 0)
            .then(|| chrono::Duration::seconds(self.min_interval_secs.min(i64::MAX as u64) as i64))
    }
}

fn default_bands() -> Vec<BandConfig> {
    vec![
        BandConfig::new(PriorityBand::URGENT, "urgent", 0),
        BandConfig::new(PriorityBand::HIGH, "high", 5 * 60),
        BandConfig::new(PriorityBand::NORMAL, "normal", 30 * 60),
        BandConfig::new(PriorityBand::LOW, "low", 24 * 60 * 60),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Serve retries by band first; otherwise oldest due retry first.
    pub retry_band_ordering: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_band_ordering: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between empty claims.
    pub poll_interval_ms: u64,
    /// Upper bound for a single processor call.
    pub processor_timeout_secs: u64,
    /// Pool workers retire after this many finished jobs.
    pub max_jobs_per_worker: Option<u64>,
    /// Ceiling for the backoff applied while the store is unreachable.
    pub store_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            processor_timeout_secs: 120,
            max_jobs_per_worker: Some(1_000),
            store_backoff_max_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }

    pub fn store_backoff_max(&self) -> Duration {
        Duration::from_millis(self.store_backoff_max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub pool_size: u32,
    pub heartbeat_interval_secs: u64,
    /// Workers silent for longer are considered crashed.
    pub worker_ttl_secs: u64,
    /// Locks older than this are reclaimed.
    pub lock_ttl_secs: u64,
    /// How long `stop` waits for draining workers before killing them.
    pub drain_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            heartbeat_interval_secs: 10,
            worker_ttl_secs: 60,
            lock_ttl_secs: 300,
            drain_timeout_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn worker_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.worker_ttl_secs as i64)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub throughput_window_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            throughput_window_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueConfig {
    pub default_max_attempts: u32,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: crate::job::NewJob::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Everything the engine needs besides the store connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bands: Vec<BandConfig>,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub stats: StatsConfig,
    pub enqueue: EnqueueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bands: default_bands(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            stats: StatsConfig::default(),
            enqueue: EnqueueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configured bands in ascending order.
    pub fn band_numbers(&self) -> Vec<PriorityBand> {
        let mut bands: Vec<PriorityBand> = self.bands.iter().map(|b| b.band).collect();
        bands.sort();
        bands
    }

    pub fn band(&self, band: PriorityBand) -> Option<&BandConfig> {
        self.bands.iter().find(|b| b.band == band)
    }

    /// Resolve a CLI/API band argument against configured numbers and names.
    pub fn resolve_band(&self, value: &str) -> Result<PriorityBand, QueueError> {
        let wanted = value.trim();
        if let Some(config) = self
            .bands
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(wanted))
        {
            return Ok(config.band);
        }
        let band: PriorityBand = wanted.parse()?;
        match self.band(band) {
            Some(_) => Ok(band),
            None => Err(QueueError::Validation(format!(
                "priority band {band} is not configured"
            ))),
        }
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.bands.is_empty() {
            return Err(QueueError::Validation("at least one band is required".into()));
        }
        let mut seen = Vec::with_capacity(self.bands.len());
        for band in &self.bands {
            if band.band.value() == 0 {
                return Err(QueueError::Validation("band numbers start at 1".into()));
            }
            if seen.contains(&band.band) {
                return Err(QueueError::Validation(format!(
                    "band {} configured twice",
                    band.band
                )));
            }
            seen.push(band.band);
        }

        let retry = &self.retry;
        if !(0.0..1.0).contains(&retry.jitter_fraction) {
            return Err(QueueError::Validation(
                "retry.jitter_fraction must be in [0, 1)".into(),
            ));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(QueueError::Validation(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }

        if self.worker.poll_interval_ms == 0 {
            return Err(QueueError::Validation("worker.poll_interval_ms must be positive".into()));
        }
        if self.worker.processor_timeout_secs >= self.supervisor.lock_ttl_secs {
            return Err(QueueError::Validation(
                "worker.processor_timeout_secs must be shorter than supervisor.lock_ttl_secs".into(),
            ));
        }
        if self.supervisor.pool_size == 0 {
            return Err(QueueError::Validation("supervisor.pool_size must be positive".into()));
        }
        if self.supervisor.heartbeat_interval_secs == 0
            || self.supervisor.heartbeat_interval_secs >= self.supervisor.worker_ttl_secs
        {
            return Err(QueueError::Validation(
                "supervisor.heartbeat_interval_secs must be positive and below worker_ttl_secs"
                    .into(),
            ));
        }
        if self.enqueue.default_max_attempts == 0 {
            return Err(QueueError::Validation(
                "enqueue.default_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.band_numbers(),
            vec![
                PriorityBand::URGENT,
                PriorityBand::HIGH,
                PriorityBand::NORMAL,
                PriorityBand::LOW
            ]
        );
        assert_eq!(
            config.band(PriorityBand::NORMAL).and_then(|b| b.min_interval()),
            Some(chrono::Duration::minutes(30))
        );
        assert_eq!(config.band(PriorityBand::URGENT).and_then(|b| b.min_interval()), None);
    }

    #[test]
    fn resolves_band_by_name_or_number() {
        let config = EngineConfig::default();
        assert_eq!(config.resolve_band("urgent").ok(), Some(PriorityBand::URGENT));
        assert_eq!(config.resolve_band("3").ok(), Some(PriorityBand::NORMAL));
        assert!(config.resolve_band("7").is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.retry.jitter_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.worker.processor_timeout_secs = config.supervisor.lock_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.bands.push(BandConfig::new(PriorityBand::HIGH, "again", 0));
        assert!(config.validate().is_err());
    }
}
