//! Reconnection delay schedule
//!
//! Exponential growth from `initial` up to `max`, forever. The attempt counter is only
//! informational; there is no give-up point.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        // a zero delay would turn the reconnect loop into a busy loop
        let initial = Duration::from_millis(config.initial_ms.max(1));
        let max = Duration::from_millis(config.max_ms).max(initial);

        Self {
            initial,
            max,
            multiplier: if config.multiplier.is_finite() {
                config.multiplier.clamp(1.0, 1_000.0)
            } else {
                1.0
            },
            current: initial,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt = self.attempt.saturating_add(1);
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Back to the initial delay, after a connection was fully established.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
