use std::time::Duration;

use crate::util::retry::RetryPolicy;

/// Reconnect schedule for failed connections.
///
/// Bounded: after `max_retries` failed reconnects the connection stays
/// `Failed` until an explicit reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// How often a connected session is polled for transport loss.
    pub health_check_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff().delay_for(retry)
    }

    fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            initial_backoff: self.initial_delay,
            max_backoff: self.max_delay,
            multiplier: 2.0,
        }
    }
}
