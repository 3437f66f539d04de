use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

/// Jittered exponential backoff for reconnect attempts.
///
/// The base delay doubles per attempt up to the cap; the actual delay is
/// drawn uniformly from the upper half of the base, so simultaneous
/// reconnecting subscribers spread out instead of stampeding.
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Back to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let doubling = 1u32 << self.attempt.min(16);
        let base = self
            .config
            .initial
            .saturating_mul(doubling)
            .min(self.config.cap);
        self.attempt = self.attempt.saturating_add(1);
        let millis = (base.as_millis() as u64).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}
