//! Capped exponential backoff for reconnect loops.

use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff calculator.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Backoff with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Backoff with a custom configuration.
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt. The first call returns the initial delay.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.multiplier.powi(self.attempt.min(64) as i32);
        let delay = (self.config.initial_delay_ms as f64 * factor)
            .min(self.config.max_delay_ms as f64)
            .max(1.0);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay as u64)
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
