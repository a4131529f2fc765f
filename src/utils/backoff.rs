//! Exponential backoff shared by the discovery retry loop and the registry
//! watcher.

use std::time::Duration;

/// Doubling delay between `initial` and `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), attempt: 0 }
    }

    /// Delay for the given retry, counting from 1. Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next retry; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for_attempt(self.attempt)
    }

    /// Start over after a healthy result
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
