//! Retry Controller (C4): exponential-backoff wrapper for transient external
//! failures (Section 4.4). Generic over the wrapped operation; callers supply
//! a classifier so each external subsystem (git, `gh`, AI CLI) keeps its own
//! transient/permanent/cancelled policy.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a classifier disposes of a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Permanent,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &atlas_core::Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            initial_delay: Duration::from_secs(u64::from(config.retry_initial_delay_sec)),
            multiplier: config.retry_multiplier,
            max_delay: Duration::from_secs(u64::from(config.retry_max_delay_sec)),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Outcome of a cancellable sleep: either it elapsed, or the scope was
/// cancelled first.
async fn cancellable_sleep(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(dur) => true,
    }
}

/// Run `op` under `policy`, retrying while `classify` returns `Retry`.
///
/// `classify` inspects the error returned by `op` and decides its
/// disposition; `Cancelled` and `Permanent` both stop retrying, differing
/// only in which error is ultimately returned to the caller (the original
/// error either way — callers distinguish via `atlas_core::ErrorKind`).
pub async fn with_retry<T, E, F, Fut, C>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Disposition,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let disposition = classify(&err);
                if disposition != Disposition::Retry || attempt >= policy.max_attempts {
                    if disposition == Disposition::Retry {
                        warn!(attempt, "retries exhausted");
                    }
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                info!(attempt, delay_sec = delay.as_secs_f64(), "retrying after backoff");
                if !cancellable_sleep(cancel, delay).await {
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_op_succeeds_first_try() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { initial_delay: Duration::from_millis(1), ..RetryPolicy::default() };
        let result: Result<u32, &str> = with_retry(
            &cancel,
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
            |_: &&str| Disposition::Retry,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { initial_delay: Duration::from_millis(1), ..RetryPolicy::default() };
        let result: Result<u32, &str> = with_retry(
            &cancel,
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok(7) } }
            },
            |_: &&str| Disposition::Retry,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { initial_delay: Duration::from_millis(1), ..RetryPolicy::default() };
        let result: Result<u32, &str> = with_retry(
            &cancel,
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("auth failed") }
            },
            |_: &&str| Disposition::Permanent,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_max_attempts_returns_last_error() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
        };
        let result: Result<u32, &str> = with_retry(
            &cancel,
            &policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still broken") }
            },
            |_: &&str| Disposition::Retry,
        )
        .await;
        assert_eq!(result.unwrap_err(), "still broken");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            multiplier: 1.0,
            max_delay: Duration::from_millis(200),
        };
        let result: Result<u32, &str> = with_retry(
            &cancel,
            &policy,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    cancel_clone.cancel();
                }
                async { Err("transient") }
            },
            |_: &&str| Disposition::Retry,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
