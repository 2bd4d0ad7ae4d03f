//! Reconnection backoff policy

use std::time::Duration;

/// Growth factor between consecutive attempts
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Exponential backoff: attempt `n` waits `base_interval × 1.5^(n-1)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_interval: Duration,
    /// Attempts before giving up and entering `Error`
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before 1-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = BACKOFF_MULTIPLIER.powi(exponent);
        Duration::try_from_secs_f64(self.base_interval.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Iterate `(attempt, delay)` over every allowed attempt
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_attempts).map(move |attempt| (attempt, self.delay(attempt)))
    }
}
