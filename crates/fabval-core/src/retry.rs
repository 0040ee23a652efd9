//! Retry logic with exponential backoff for device commands.
//!
//! Only transient adapter failures ([`AdapterError::is_transient`]) are
//! retried. A malformed response fails immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterError;

/// Per-check retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Backoff before the second attempt (default: 200ms).
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff (default: 5 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Compute the backoff before retry number `retry` (0-based).
    ///
    /// `initial_backoff * backoff_multiplier^retry`, capped at `max_backoff`,
    /// plus up to 50% jitter when enabled.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;
        let capped = (base_ms * self.backoff_multiplier.powi(retry as i32)).min(max_ms);

        if self.jitter && capped >= 2.0 {
            let jitter_ms = rand::thread_rng().gen_range(0..=(capped as u64 / 2));
            Duration::from_millis((capped as u64).saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped as u64)
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success {
        value: T,
        attempts: u32,
    },
    /// Retries exhausted, or the error was not transient.
    Exhausted {
        last_error: AdapterError,
        attempts: u32,
    },
    /// The run was cancelled while waiting to retry.
    Cancelled {
        attempts: u32,
    },
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    /// Backoff sleeps end early if `cancel` fires.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(e) if !e.is_transient() || attempt >= max_attempts => {
                    return RetryOutcome::Exhausted {
                        last_error: e,
                        attempts: attempt,
                    }
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient command failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return RetryOutcome::Cancelled { attempts: attempt };
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::DeviceId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn timeout_err() -> AdapterError {
        AdapterError::Timeout {
            device: DeviceId::from("leaf1"),
            timeout_ms: 100,
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(200));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_compute_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));

        let capped = RetryPolicy {
            max_backoff: Duration::from_millis(500),
            ..policy
        };
        assert_eq!(capped.backoff(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };
        for _ in 0..50 {
            let b = policy.backoff(0);
            assert!(b >= Duration::from_millis(100) && b <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_transient_failures() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = Arc::clone(&counter);
        let outcome = executor
            .execute(&cancel, move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(timeout_err())
                    } else {
                        Ok("up")
                    }
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                value: "up",
                attempts: 3
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let cancel = CancellationToken::new();
        let outcome: RetryOutcome<()> = executor
            .execute(&cancel, || async { Err(timeout_err()) })
            .await;
        match outcome {
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.kind(), "timeout");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(&cancel, move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err(AdapterError::malformed(&DeviceId::from("leaf1"), "bad", "xx"))
                }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let executor = RetryExecutor::new(RetryPolicy {
            initial_backoff: Duration::from_secs(3600),
            jitter: false,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: RetryOutcome<()> = executor
            .execute(&cancel, || async { Err(timeout_err()) })
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 1 }));
    }
}
