use std::time::Duration;

/// Default upper bound on the delay between reconnection attempts.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(15);

/// Quadratic reconnection backoff.
///
/// The delay after a failure is `failures² × unit`, where `failures` is the number of consecutive failures seen
/// *before* this one, capped at `max_delay`. The first failure therefore retries immediately, and with the default
/// one-second unit the delays run 0s, 1s, 4s, 9s, 15s, 15s, ...
#[derive(Debug)]
pub(crate) struct Backoff {
    consecutive_failures: u32,
    max_delay: Duration,
    unit: Duration,
}

impl Backoff {
    pub fn with_unit(max_delay: Duration, unit: Duration) -> Self {
        Backoff { consecutive_failures: 0, max_delay, unit }
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let previous = self.consecutive_failures;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        self.unit
            .checked_mul(previous.saturating_mul(previous))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns the number of consecutive failures recorded since the last reset.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
