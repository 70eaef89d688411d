//! Retry pacing with exponential backoff.

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry schedule configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the delay between retries.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 4,
        }
    }
}

/// Tracks the retry budget for one operation.
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleeps before the next attempt. Returns `false` once the retry budget
    /// is spent, without sleeping.
    pub async fn wait(&mut self) -> bool {
        if self.attempt >= self.config.max_retries {
            return false;
        }
        self.attempt += 1;

        debug!(
            attempt = self.attempt,
            backoff = ?self.current,
            "waiting before retry"
        );

        sleep(self.current).await;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.multiplier);
        self.current = next.min(self.config.max_backoff);

        true
    }

    /// Number of retries performed so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next `wait` call would sleep for.
    pub fn current_backoff(&self) -> Duration {
        self.current
    }
}
