//! Retry with exponential backoff and jitter, bounded by a [`CancelScope`].
//!
//! Manifest application runs against an API server that is itself still
//! coming up, so most failures early in a bootstrap are transient. Retries
//! continue until the operation succeeds, the attempt budget runs out, or the
//! surrounding scope ends.
//!
//! # Example
//!
//! ```ignore
//! use bootstrap_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let discovery = retry_with_backoff(&RetryConfig::default(), "api-discovery", &scope, || {
//!     Discovery::new(client.clone()).run()
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::cancel::CancelScope;
use crate::Error;

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until the scope ends)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after every failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Jittered exponential delay sequence
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// The next delay: 0.5x to 1.5x of the nominal value, nominal value capped
    /// at the configured maximum.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.next.as_secs_f64() * jitter);
        self.next = Duration::from_secs_f64(
            (self.next.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        delay
    }
}

/// Execute an async operation with exponential backoff until it succeeds,
/// `max_attempts` is reached, the error is not [retryable](Error::is_retryable),
/// or `scope` ends.
///
/// When the scope ends between attempts the scope's error is returned instead
/// of the last operation error.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    scope: &CancelScope,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut backoff = config.backoff();

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        if !err.is_retryable() {
            return Err(err);
        }

        let delay = backoff.next_delay();
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = scope.done() => {
                return Err(scope.err().unwrap_or(err));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
