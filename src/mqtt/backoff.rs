use std::time::Duration;

/// Exponential reconnect delay with a cap and no retry limit
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max,
            factor,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; grows until it reaches the cap.
    pub fn next_delay(&mut self) -> Duration {
        let growth = self.factor.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(growth).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    // Called once the broker acknowledges a connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
