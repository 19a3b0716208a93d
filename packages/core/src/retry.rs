//! Bounded exponential backoff with deterministic jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Backoff never drops below this.
const MIN_BACKOFF_MS: u64 = 1;

/// Retry tuning, loaded from the `[retry]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound applied before jitter.
    pub max_delay_ms: u64,
    /// Jitter spread as a fraction of the delay, in `[0, 1)`.
    pub jitter_fraction: f64,
    pub jitter_seed: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 3_600_000,
            jitter_fraction: 0.1,
            jitter_seed: 0,
        }
    }
}

/// What to do with a job after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub terminal: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

impl RetryDecision {
    pub fn terminal() -> Self {
        Self {
            terminal: true,
            retry_at: None,
        }
    }

    pub fn retry_at(at: DateTime<Utc>) -> Self {
        Self {
            terminal: false,
            retry_at: Some(at),
        }
    }
}

/// Pure retry policy: the same inputs always give the same decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// True when one more finished attempt would use up the budget.
    pub fn exhausted(attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count.saturating_add(1) >= max_attempts
    }

    /// Decide the fate of a job that has finished `attempt_count` attempts before this failure.
    pub fn next(&self, attempt_count: u32, max_attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if Self::exhausted(attempt_count, max_attempts) {
            return RetryDecision::terminal();
        }
        let delay = chrono::Duration::from_std(self.backoff(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        let at = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::retry_at(at)
    }

    /// `min(base * 2^attempt, cap)` scaled by a seeded jitter factor.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
        let raw = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);

        let jittered = (raw as f64 * (1.0 + self.jitter(attempt_count))).round();
        let ms = if jittered.is_finite() && jittered >= MIN_BACKOFF_MS as f64 {
            jittered as u64
        } else {
            MIN_BACKOFF_MS
        };
        Duration::from_millis(ms)
    }

    fn jitter(&self, attempt_count: u32) -> f64 {
        let spread = self.config.jitter_fraction;
        if spread <= 0.0 || !spread.is_finite() {
            return 0.0;
        }
        let seed = self.config.jitter_seed
            ^ u64::from(attempt_count).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(seed);
        rng.random_range(-spread..=spread)
    }
}
