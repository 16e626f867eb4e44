use std::time::Duration;
use storyweave_core::RealtimeConfig;

/// Exponential backoff for channel resubscription.
///
/// `delay(n) = min(base * 2^n, cap)` for attempt `n >= 1`. Once `n` exceeds
/// `max_attempts` no further attempt is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt`, ignoring the attempt limit
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before attempt `attempt`, or `None` once retries are exhausted
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_attempts).then(|| self.delay(attempt))
    }
}
