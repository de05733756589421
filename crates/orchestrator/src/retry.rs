//! Bounded retry of fallible async operations.

use std::future::Future;

use saga_store::RetryPolicy;
use thiserror::Error;

/// Returned when every attempt of a retried operation failed.
#[derive(Debug, Error)]
#[error("Gave up after {attempts} attempts: {last_error}")]
pub struct RetriesExhausted<E: std::fmt::Display + std::fmt::Debug> {
    pub attempts: u32,
    pub last_error: E,
}

/// Runs an operation until it succeeds or the policy's attempts run out.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(RetryPolicy::fixed(1, std::time::Duration::ZERO))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `operation` with the 1-based attempt number, sleeping between
    /// failed attempts as the backoff dictates.
    ///
    /// On success returns the value and the number of attempts it took.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<(T, u32), RetriesExhausted<E>>
    where
        E: std::fmt::Display + std::fmt::Debug,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if attempt >= max_attempts => {
                    return Err(RetriesExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::debug!(attempt, max_attempts, error = %e, ?delay, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
