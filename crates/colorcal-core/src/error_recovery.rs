//! Bounded retry of transient transport failures.
//!
//! Only [`ColorError::TransportFailure`](crate::error::ColorError::TransportFailure)
//! is retried. Protocol errors, setup requests and aborts are returned on
//! first occurrence.

use crate::abort::AbortFlag;
use crate::error::ColorResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Defines a policy for retrying an exchange.
///
/// # Example
///
/// ```rust
/// use colorcal_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of tries, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Constant delay between tries.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three tries with 100 ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Single try, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Effective number of tries.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the policy
/// is exhausted.
///
/// The abort flag is checked before every try and during backoff. On
/// exhaustion the last transport error is returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    abort: &AbortFlag,
    label: &str,
    mut op: F,
) -> ColorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ColorResult<T>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        abort.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    target: "colorcal::transport",
                    attempt,
                    max_attempts,
                    operation = label,
                    error = %err,
                    "Transient failure, retrying"
                );
                attempt += 1;
                abort.sleep(policy.backoff_delay).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ColorError, TransportError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout() -> ColorError {
        ColorError::TransportFailure(TransportError::Timeout { timeout_ms: 10 })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = retry_transient(&policy, &AbortFlag::new(), "test", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                Ok(42)
            } else {
                Err(timeout())
            }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_fails_after_budget() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result: ColorResult<()> =
            retry_transient(&policy, &AbortFlag::new(), "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(timeout())
            })
            .await;
        assert!(matches!(result, Err(ColorError::TransportFailure(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_protocol_error_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: ColorResult<()> =
            retry_transient(&RetryPolicy::default(), &AbortFlag::new(), "test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ColorError::ProtocolError {
                    code: 3,
                    message: "bad command".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(ColorError::ProtocolError { code: 3, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_checked_before_first_try() {
        let abort = AbortFlag::new();
        abort.trigger();
        let result: ColorResult<()> =
            retry_transient(&RetryPolicy::default(), &abort, "test", || async { Ok(()) }).await;
        assert!(matches!(result, Err(ColorError::UserAbort)));
    }
}
