//! Retry utilities.
//!
//! Two shapes of retry live here:
//!
//! - [`retry`]: bounded, fixed-interval polling used by workflows that wait on
//!   another machine (join token, control-plane upgrade). The operation's
//!   error decides whether to keep waiting: retryable errors sleep and try
//!   again, anything else aborts immediately.
//! - [`retry_with_backoff`]: exponential backoff with jitter for transient
//!   failures of external calls (provisioner HTTP API).
//!
//! # Example
//!
//! ```ignore
//! use foundry::retry::retry;
//!
//! let token = retry(120, Duration::from_secs(10), "join_token", &cancel, || async {
//!     executor.run(&target, RemoteOperation::CreateJoinToken, &args, &cancel).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Error;

/// Call `operation` up to `max_attempts` times, sleeping `interval` between
/// attempts.
///
/// Returns the first success. A non-retryable error (see
/// [`Error::is_retryable`]) is returned immediately without spending the rest
/// of the budget; otherwise the last error is returned once the budget runs
/// out. Cancelling `cancel` cuts a pending sleep short with
/// [`Error::Cancelled`].
pub async fn retry<F, Fut, T>(
    max_attempts: u32,
    interval: Duration,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed permanently, giving up"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation still failing after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Not ready yet, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        debug!(operation = %operation_name, attempt, "Cancelled while waiting");
                        return Err(Error::cancelled(operation_name));
                    }
                }
            }
        }
    }
}

/// Configuration for operations that may fail transiently.
///
/// Used for external HTTP calls to handle transient failures with
/// exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
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
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, a non-retryable error, or `max_attempts` (when set).
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable()
                    || (config.max_attempts > 0 && attempt >= config.max_attempts)
                {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn idle() -> CancellationToken {
        CancellationToken::new()
    }

    fn not_ready() -> Error {
        Error::dependency_not_ready("worker-0", "control plane still upgrading")
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_sleeps() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = tokio::time::Instant::now();

        let result = retry(5, Duration::from_secs(10), "op", &idle(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(not_ready())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_wait_short() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let start = tokio::time::Instant::now();

        let result: Result<(), Error> =
            retry(120, Duration::from_secs(10), "op", &cancel, || async { Err(not_ready()) })
                .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_returns_without_sleeping() {
        let start = tokio::time::Instant::now();
        let result = retry(3, Duration::from_secs(10), "op", &idle(), || async { Ok("ok") })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_budget_is_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), Error> = retry(3, Duration::from_secs(1), "op", &idle(), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(Error::dependency_not_ready("m", format!("attempt {n}")))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_aborts_without_spending_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = tokio::time::Instant::now();

        let result: Result<(), Error> = retry(120, Duration::from_secs(10), "op", &idle(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::cancelled("op"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn backoff_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::provisioner("m", "503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<(), Error> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::provisioner("m", "always fails"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_stops_on_permanent_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> =
            retry_with_backoff(&RetryConfig::with_max_attempts(10), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::provisioner_permanent("m", "401 unauthorized"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
