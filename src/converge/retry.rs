//! Retry policy for transient execution failures
//!
//! Exponential backoff with optional jitter, bounded by a maximum delay.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often and how patiently a failed action is retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay between half and all of its nominal value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// 5 attempts, 1s base delay doubling up to 30s, with jitter
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
            jitter: false,
        }
    }

    /// No retries at all
    pub fn once() -> Self {
        Self::new(1, 0, 0)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Nominal delay after the failed attempt number `attempt` (1-based)
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay to wait after the failed attempt number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let ms = nominal.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }

    /// Upper bound on the time spent in one execution, given the
    /// per-attempt timeout
    pub fn budget(&self, attempt_timeout: Duration) -> Duration {
        let backoff: Duration = (1..self.max_attempts)
            .map(|attempt| self.nominal_delay(attempt))
            .sum();
        attempt_timeout * self.max_attempts + backoff
    }
}
