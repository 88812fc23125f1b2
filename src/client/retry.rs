use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;

/// Bounded retry with linear backoff: the wait before attempt `n + 1` is `base_backoff * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self { max_attempts, base_backoff }
    }

    /// Single attempt, no sleeping.
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt)
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` is exhausted, returning the last error.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(label, attempt, max_attempts, "succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(err) => {
                let backoff = policy.backoff_after(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::AppError;

    #[test]
    fn backoff_is_linear() {
        let p = RetryPolicy::new(3, Duration::from_secs(15));
        assert_eq!(p.backoff_after(1), Duration::from_secs(15));
        assert_eq!(p.backoff_after(2), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let out = with_retry(RetryPolicy::new(3, Duration::from_secs(15)), "page", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(AppError::Api(format!("boom {n}")))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 15s after the first failure, 30s after the second.
        assert!(started.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = with_retry(RetryPolicy::new(2, Duration::from_secs(1)), "batch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Api("down".to_string()))
        })
        .await;

        assert!(matches!(res, Err(AppError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = with_retry(RetryPolicy::new(0, Duration::ZERO), "x", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
