//! Bounded exponential backoff with cancellable sleeps.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff state for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff following `config`.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            attempt: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The next delay: `initial * multiplier^attempt`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.multiplier.powi(self.attempt.min(32) as i32);
        let raw = self.initial.as_secs_f64() * exp;
        let capped = Duration::from_secs_f64(raw.min(self.max.as_secs_f64()));
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter && !capped.is_zero() {
            let micros = capped.as_micros() as u64;
            let jittered = rand::rng().random_range(micros / 2..=micros);
            Duration::from_micros(jittered)
        } else {
            capped
        }
    }

    /// Sleep for the next delay, or fail with `Cancelled` if `cancel` fires first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<()> {
        let delay = self.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}
