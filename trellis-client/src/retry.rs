//! Retry policies for connection-level failures.
//!
//! Only errors that report [`crate::CoordinationError::is_retryable`] are retried;
//! everything else goes straight back to the caller.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::client::CoordinationClient;
use crate::session::Session;
use crate::{CoordinationError, Result};

/// Decides whether, and after how long, a failed operation is retried.
pub trait RetryPolicy: Send + Sync {
    /// `retry_count` is zero for the first retry. Returns the sleep before the
    /// next attempt, or `None` to give up.
    fn allow_retry(&self, retry_count: u32, elapsed: Duration) -> Option<Duration>;
}

/// Retries a bounded number of times with randomized exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_retries: u32,
    max_sleep: Duration,
}

impl ExponentialBackoffRetry {
    /// Upper bound on `max_retries`; beyond this the backoff overflows.
    pub const MAX_RETRIES_LIMIT: u32 = 29;

    pub fn new(base_sleep: Duration, max_retries: u32) -> Self {
        Self::with_max_sleep(base_sleep, max_retries, Duration::from_secs(u32::MAX as u64))
    }

    pub fn with_max_sleep(base_sleep: Duration, max_retries: u32, max_sleep: Duration) -> Self {
        Self {
            base_sleep,
            max_retries: max_retries.min(Self::MAX_RETRIES_LIMIT),
            max_sleep,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn sleep_for(&self, retry_count: u32) -> Duration {
        let ceiling = 1u32 << (retry_count + 1).min(Self::MAX_RETRIES_LIMIT);
        let factor = rand::rng().random_range(1..=ceiling);
        self.base_sleep
            .saturating_mul(factor)
            .min(self.max_sleep)
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, retry_count: u32, _elapsed: Duration) -> Option<Duration> {
        (retry_count < self.max_retries).then(|| self.sleep_for(retry_count))
    }
}

/// Retries `n` times with a fixed sleep.
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    n: u32,
    sleep: Duration,
}

impl RetryNTimes {
    pub fn new(n: u32, sleep: Duration) -> Self {
        Self { n, sleep }
    }
}

impl RetryPolicy for RetryNTimes {
    fn allow_retry(&self, retry_count: u32, _elapsed: Duration) -> Option<Duration> {
        (retry_count < self.n).then_some(self.sleep)
    }
}

/// Run `op` against `client`, retrying retryable failures per the client's
/// retry policy.
pub async fn call_with_retry<T, F, Fut>(client: &CoordinationClient, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(client.retry_policy().as_ref(), op).await
}

/// Run `op` with the client's live session, retrying retryable failures.
///
/// The session is fetched again before every attempt, so a retry after the
/// session has been replaced runs against the new one.
pub async fn call_with_session<T, F, Fut>(client: &CoordinationClient, mut op: F) -> Result<T>
where
    F: FnMut(Arc<dyn Session>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = client.retry_policy();
    let start = Instant::now();
    let mut retry_count = 0;

    loop {
        let outcome = match client.handle().await {
            Ok(session) => op(session).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => {
                let sleep = next_sleep(policy.as_ref(), &e, retry_count, start).ok_or(e)?;
                retry_count += 1;
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

/// Like [`call_with_retry`] with an explicit policy.
pub async fn retry_with<T, F, Fut>(policy: &dyn RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut retry_count = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let sleep = next_sleep(policy, &e, retry_count, start).ok_or(e)?;
                retry_count += 1;
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

fn next_sleep(
    policy: &dyn RetryPolicy,
    error: &CoordinationError,
    retry_count: u32,
    start: Instant,
) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    let sleep = policy.allow_retry(retry_count, start.elapsed())?;
    debug!(
        retry_count,
        sleep_ms = sleep.as_millis() as u64,
        error = %error,
        "Retrying operation"
    );
    Some(sleep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_bounds() {
        let policy = ExponentialBackoffRetry::new(Duration::from_millis(10), 3);
        for retry in 0..3 {
            let sleep = policy.allow_retry(retry, Duration::ZERO).unwrap();
            let ceiling = 10 * (1u64 << (retry + 1));
            assert!(sleep >= Duration::from_millis(10));
            assert!(sleep <= Duration::from_millis(ceiling));
        }
        assert!(policy.allow_retry(3, Duration::ZERO).is_none());
    }

    #[test]
    fn test_exponential_backoff_respects_max_sleep() {
        let policy = ExponentialBackoffRetry::with_max_sleep(
            Duration::from_millis(100),
            10,
            Duration::from_millis(150),
        );
        for retry in 0..10 {
            assert!(policy.allow_retry(retry, Duration::ZERO).unwrap() <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_max_retries_clamped() {
        let policy = ExponentialBackoffRetry::new(Duration::from_millis(1), 1000);
        assert_eq!(policy.max_retries(), ExponentialBackoffRetry::MAX_RETRIES_LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_retries_only_retryable_errors() {
        let policy = RetryNTimes::new(3, Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = retry_with(&policy, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoordinationError::ConnectionLoss)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        attempts.store(0, Ordering::SeqCst);
        let result: Result<()> = retry_with(&policy, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CoordinationError::NoNode("/x".into()))
        })
        .await;
        assert_eq!(result, Err(CoordinationError::NoNode("/x".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let policy = RetryNTimes::new(2, Duration::from_millis(5));
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result: Result<()> = retry_with(&policy, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CoordinationError::OperationTimeout)
        })
        .await;
        assert_eq!(result, Err(CoordinationError::OperationTimeout));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
