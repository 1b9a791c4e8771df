//! Retry utilities with exponential backoff and jitter.
//!
//! Two shapes are provided:
//!
//! - [`Backoff`]: a stateful delay generator for long-running loops that
//!   decide for themselves when to retry (e.g. watch resubscription).
//! - [`retry_with_backoff_if`]: wrap a single async operation and retry it
//!   until it succeeds, fails permanently, or attempts run out.
//!
//! # Example
//!
//! ```ignore
//! use nodetrust_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let node = retry_with_backoff_if(
//!     &RetryConfig::with_max_attempts(5),
//!     "get_node",
//!     || async { store.get("worker-1").await },
//!     |e| e.is_transient(),
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
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

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Whether `attempt` (1-based) is the last one allowed
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Exponential backoff state.
///
/// Each call to [`Backoff::next_delay`] returns the current delay with
/// 0.5x-1.5x jitter applied, then grows the base delay by the multiplier up
/// to `max_delay`. [`Backoff::reset`] returns to `initial_delay` after a
/// success.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `config.initial_delay`
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Number of consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Base delay the next call to `next_delay` will jitter around
    pub fn current_base(&self) -> Duration {
        self.current
    }

    /// Delay to wait before the next attempt; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        // Exponential backoff, capped at max_delay
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        jittered
    }

    /// Return to the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.failures = 0;
    }
}

/// Execute an async operation with exponential backoff and jitter, retrying
/// only errors for which `should_retry` returns true.
///
/// Non-retryable errors are returned immediately; retryable ones are retried
/// until success or until `max_attempts` is exhausted.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut backoff = Backoff::new(config.clone());

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) => {
                if config.is_exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
