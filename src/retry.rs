use fieldx::fxstruct;
use garde::Validate;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, FetchError, Result};

/// Called before each backoff wait with the number of the attempt that just failed and its error.
pub type RetryObserver = Arc<dyn Fn(u32, &FetchError) + Send + Sync>;

#[derive(Debug, Clone, Validate)]
#[fxstruct(get(copy), builder)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the operation runs at most `max_retries + 1` times.
    #[fieldx(default(3))]
    #[garde(range(max = 30))]
    max_retries: u32,

    #[fieldx(default(Duration::from_millis(1000)))]
    #[garde(skip)]
    delay: Duration,

    /// Double the delay after every failed attempt.
    #[fieldx(default(true))]
    #[garde(skip)]
    backoff: bool,
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt number `attempt` (1-based): `delay * 2^(attempt-1)` with backoff,
    /// `delay` otherwise.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff {
            self.delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        }
        else {
            self.delay
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::builder()
            .max_retries(0)
            .build()
            .unwrap_or_default()
    }
}

/// Run `op` until it succeeds, fails with a non-retriable error, or runs out of retries.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    retry_with(policy, op, None).await
}

pub async fn retry_with<T, F, Fut>(policy: &RetryPolicy, mut op: F, observer: Option<RetryObserver>) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retriable() {
            debug!(attempt, %err, "not retrying");
            return Err(Error::Fetch(err));
        }

        if attempt > policy.max_retries {
            warn!(attempts = attempt, %err, "retries exhausted");
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                source:   err,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, ?delay, %err, "attempt failed, retrying");
        if let Some(observer) = observer.as_ref() {
            observer(attempt, &err);
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy(max_retries: u32, backoff: bool) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .delay(Duration::from_millis(100))
            .backoff(backoff)
            .build()
            .unwrap()
    }

    #[test]
    fn delays() {
        let p = policy(5, true);
        let delays: Vec<_> = (1..=4).map(|a| p.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));

        let p = policy(5, false);
        assert_eq!(p.delay_for(4), Duration::from_millis(100));
        assert_eq!(RetryPolicy::none().max_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry(&policy(3, true), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FetchError::network("down")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.fetch_error(), Some(&FetchError::network("down")));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_fails_at_once() {
        for status in [400, 401, 403] {
            let calls = AtomicU32::new(0);
            let err = retry(&policy(3, true), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(FetchError::from_status(status, "no")) }
            })
            .await
            .unwrap_err();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(matches!(err, Error::Fetch(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_growing_delays() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let observed = seen.clone();

        let value = retry_with(
            &policy(5, true),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(FetchError::Timeout(Duration::from_secs(1)))
                    }
                    else {
                        Ok(n)
                    }
                }
            },
            Some(Arc::new(move |attempt: u32, err: &FetchError| {
                observed.lock().push((attempt, err.clone()));
            })),
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        let seen = seen.lock();
        assert_eq!(seen.iter().map(|(a, _)| *a).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(seen.iter().all(|(_, e)| matches!(e, FetchError::Timeout(_))));
        // 100 + 200 + 400
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }
}
