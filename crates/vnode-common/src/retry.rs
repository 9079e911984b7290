//! Retry utilities with exponential backoff and jitter.
//!
//! Used for short, bounded retry loops inside a single operation (lease
//! renewal, pod status conflicts). Work that should be retried across
//! reconcile attempts goes back through the reconcile queue instead.
//!
//! # Example
//!
//! ```ignore
//! use vnode_common::retry::{retry_if, RetryConfig};
//!
//! let lease = retry_if(
//!     &RetryConfig::immediate(5),
//!     "renew_lease",
//!     |e: &Error| e.is_conflict(),
//!     || async { leases.update(&lease).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
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
            max_attempts: 0,
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

    /// Create a config that retries back-to-back with no delay
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until success or until `max_attempts` is exhausted,
/// returning the last error in that case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but only retries errors accepted by `should_retry`.
///
/// Errors rejected by the predicate are returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                if delay.is_zero() {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed, retrying immediately"
                    );
                    continue;
                }

                // Jitter: 0.5x to 1.5x of the delay
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

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_immediate_retries_exhaust_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff(&RetryConfig::immediate(5), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_predicate_stops_on_permanent_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_if(
            &RetryConfig::immediate(5),
            "op",
            |e: &&str| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("conflict")
                    } else {
                        Err("forbidden")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
