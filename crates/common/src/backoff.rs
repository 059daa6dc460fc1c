//! Exponential backoff with a capped delay and an optional attempt limit.
//!
//! Reconnection loops in the event bus and the stream client both use this
//! instead of recursing on failure: [`retry`] is a plain loop that sleeps
//! between attempts and stops on success, exhaustion, or cancellation.

use crate::error::{Error, Result};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Maximum number of attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Stateful delay generator for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next_delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            next_delay,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.config.max_delay);
        Some(delay.min(self.config.max_delay))
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.config.initial_delay;
    }
}

/// Run `op` until it succeeds, sleeping between failures.
///
/// The closure receives the 1-based attempt number. Cancellation is checked
/// while sleeping, so a cancelled retry returns promptly with
/// [`Error::Cancelled`].
pub async fn retry<T, E, F, Fut>(
    config: &BackoffConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut backoff = Backoff::new(config.clone());
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let last_error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };

        let Some(delay) = backoff.next_delay() else {
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                last_error,
            });
        };

        warn!(
            "{} attempt {} failed: {}, retrying in {:?}",
            label, attempt, last_error, delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
