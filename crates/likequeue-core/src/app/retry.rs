//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Retry policy for failed tasks.
///
/// Pure exponential backoff: no jitter, no cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 2s base, doubling: the delay after failure `n` is `2^n` seconds.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
        }
    }

    /// Delay before the next run, given the number of failed attempts so far
    /// (1-indexed): `base_delay * multiplier^(attempts - 1)`.
    ///
    /// With the default policy:
    /// - attempt 1: 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    /// - attempt 4: 16s
    /// - attempt 5: 32s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }
}
