//! Retry policy: attempt budget and backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per task, the first one included.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of the uniform jitter added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1500),
            multiplier: 2.0,
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Backoff before the attempt that follows failed attempt `attempt` (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`.
    ///
    /// With the defaults: 1.5s, 3s, 6s.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// `next_delay` plus a uniform draw from `[0, jitter]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.next_delay(attempt);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rng.gen_range(0..=self.jitter.as_millis() as u64);
        base.saturating_add(Duration::from_millis(extra))
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
