//! Retry policy for upstream fetches.
//!
//! Exponential backoff with an optional random jitter on top.

use super::capabilities::FetchError;
use crate::config::PollerSettings;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total fetch attempts per subject per cycle, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Cap for exponential growth, applied before jitter.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the backoff added at random, 0.0 disables jitter.
    pub jitter_ratio: f64,
    /// How many `RateLimited` waits a single fetch may go through.
    pub max_rate_limit_waits: u32,
    /// Longer `Retry-After` delays are not waited out within the cycle.
    pub max_rate_limit_wait: Duration,
}

impl RetryPolicy {
    pub fn new(settings: &PollerSettings) -> Self {
        Self {
            max_attempts: settings.max_fetch_attempts,
            initial_backoff: Duration::from_secs_f64(settings.initial_backoff_secs),
            max_backoff: Duration::from_secs_f64(settings.max_backoff_secs),
            backoff_multiplier: settings.backoff_multiplier,
            jitter_ratio: settings.jitter_ratio,
            max_rate_limit_waits: settings.max_rate_limit_waits,
            max_rate_limit_wait: Duration::from_secs(settings.max_rate_limit_wait_secs),
        }
    }

    /// Deterministic part of the delay before retry number `retry_count` (0-based).
    ///
    /// `initial_backoff * multiplier^retry_count`, capped at `max_backoff`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// `backoff(retry_count)` plus up to `jitter_ratio` of it, chosen at random.
    pub fn backoff_with_jitter(&self, retry_count: u32) -> Duration {
        let base = self.backoff(retry_count);
        if self.jitter_ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter_ratio);
        base.mul_f64(1.0 + extra)
    }

    /// Whether a fetch that has failed `failures` times so far should be tried again.
    pub fn should_retry(&self, error: &FetchError, failures: u32) -> bool {
        error.is_retryable() && failures < self.max_attempts
    }

    /// Upper bound of total time spent sleeping between attempts, rate limits excluded.
    pub fn max_total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|n| self.backoff(n).mul_f64(1.0 + self.jitter_ratio.max(0.0)))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&PollerSettings::default())
    }
}
