//! Retry utilities for calls to external services.
//!
//! Callers classify their own errors through [`Retryable`]; only retryable
//! failures are attempted again, with a configurable backoff between attempts.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Classifies an error as transient (worth another attempt) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier; 1.0 gives a fixed delay.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// `attempts` total tries separated by the same `delay`, no jitter.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_backoff: delay,
            max_backoff: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Calculate backoff duration for a given attempt.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-retryable failure, returned without further attempts.
    Permanent(E),
    /// Every attempt failed with a retryable error, in attempt order.
    Exhausted(Vec<E>),
}

impl<E> RetryError<E> {
    /// The error from the final attempt.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Permanent(e) => Some(e),
            RetryError::Exhausted(errors) => errors.into_iter().last(),
        }
    }
}

/// Execute `f` until it succeeds, fails permanently, or runs out of attempts.
///
/// `f` receives the zero-based attempt number.
///
/// # Example
/// ```ignore
/// let result = retry_call(
///     &RetryConfig::fixed(3, Duration::from_secs(2)),
///     "CrearComprobante",
///     |_attempt| async { transport.post(&request).await },
/// ).await;
/// ```
pub async fn retry_call<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut failures = Vec::new();

    loop {
        match f(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !error.is_retryable() {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        "Call failed with permanent error, not retrying"
                    );
                    return Err(RetryError::Permanent(error));
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        "Call failed after max retries"
                    );
                    failures.push(error);
                    return Err(RetryError::Exhausted(failures));
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %error,
                    backoff_ms = backoff.as_millis() as u64,
                    "Call failed, retrying after backoff"
                );
                failures.push(error);

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
