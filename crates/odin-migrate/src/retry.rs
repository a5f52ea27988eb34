//! Bounded exponential backoff for transient database errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{MigrateError, Result};

/// Retry behavior for transient errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (backoff is capped here).
    pub max_delay: Duration,
    /// Deadline for a single attempt. An attempt that misses it counts as a
    /// transient connection failure. `None` waits indefinitely.
    pub operation_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            operation_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl RetryConfig {
    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Same policy, with attempts that are never cut short.
    ///
    /// For operations that enforce their own deadline because abandoning
    /// them halfway is not safe.
    pub fn without_timeout(&self) -> Self {
        Self {
            operation_timeout: None,
            ..self.clone()
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let outcome = match config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(MigrateError::Connection(format!(
                    "{} timed out after {:?}",
                    what, limit
                ))),
            },
            None => op().await,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    "{} failed with transient error, retry {}/{} in {:?}: {}",
                    what,
                    attempt,
                    config.max_attempts - 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            operation_timeout: Some(Duration::from_millis(50)),
        }
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            operation_timeout: None,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "write", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MigrateError::Connection("reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logical_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MigrateError::ConstraintViolation {
                source_id: None,
                message: "users_email_key".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MigrateError::Connection("down".into()))
        })
        .await;
        assert!(matches!(result, Err(MigrateError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hung_attempt_times_out_and_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "read", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_every_attempt_hanging_is_a_connection_error() {
        let result: Result<()> = with_retry(&fast(), "read", || std::future::pending()).await;
        let err = result.unwrap_err();
        assert!(matches!(err, MigrateError::Connection(_)));
        assert!(err.to_string().contains("read timed out"));
    }

    #[tokio::test]
    async fn test_without_timeout_waits_for_slow_attempts() {
        let config = fast().without_timeout();
        let result = with_retry(&config, "write", || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(1)
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
