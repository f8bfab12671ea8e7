//! Fixed-interval retry around a single store write.

use crate::store::StoreError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type RetryCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;
pub type MaxRetryCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Retries a write every `interval` until it succeeds or `max_retry` attempts
/// have failed. A `max_retry` of 0 retries forever.
///
/// `on_retry` sees every failed attempt. `on_max_retry_reached` runs once per
/// exhausted write and is awaited before the final error is returned.
#[derive(Clone)]
pub struct Retrier {
    interval: Duration,
    max_retry: u32,
    on_retry: Option<RetryCallback>,
    on_max_retry_reached: Option<MaxRetryCallback>,
}

impl Retrier {
    pub fn new(interval: Duration, max_retry: u32) -> Self {
        Self {
            interval,
            max_retry,
            on_retry: None,
            on_max_retry_reached: None,
        }
    }

    pub fn on_retry(mut self, callback: impl Fn(&StoreError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_max_retry_reached<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_max_retry_reached = Some(Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(callback())
        }));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if let Some(on_retry) = &self.on_retry {
                on_retry(&err);
            }

            if self.max_retry != 0 && attempt >= self.max_retry {
                debug!(attempt, "Store retry budget exhausted");
                if let Some(on_max) = &self.on_max_retry_reached {
                    on_max().await;
                }
                return Err(err);
            }

            debug!(attempt, interval = ?self.interval, error = %err, "Retrying store write");
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    struct Counters {
        attempts: Arc<AtomicU32>,
        retries: Arc<AtomicU32>,
        exhausted: Arc<AtomicU32>,
    }

    fn retrier(max_retry: u32) -> (Retrier, Counters) {
        let counters = Counters {
            attempts: Arc::default(),
            retries: Arc::default(),
            exhausted: Arc::default(),
        };
        let retries = counters.retries.clone();
        let exhausted = counters.exhausted.clone();

        let retrier = Retrier::new(Duration::from_secs(1), max_retry)
            .on_retry(move |_| {
                retries.fetch_add(1, Ordering::SeqCst);
            })
            .on_max_retry_reached(move || {
                let exhausted = exhausted.clone();
                async move {
                    exhausted.fetch_add(1, Ordering::SeqCst);
                }
            });
        (retrier, counters)
    }

    fn failing_until(
        attempts: Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl FnMut() -> BoxFuture<'static, Result<u32, StoreError>> {
        move || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n >= succeed_on {
                    Ok(n)
                } else {
                    Err(StoreError::Request("connection refused".to_string()))
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures_does_not_exhaust() {
        let (retrier, counters) = retrier(5);

        let started = Instant::now();
        let result = retrier.run(failing_until(counters.attempts.clone(), 3)).await;

        assert_eq!(assert_ok!(result), 3);
        assert_eq!(counters.retries.load(Ordering::SeqCst), 2);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_fires_once_and_returns_error() {
        let (retrier, counters) = retrier(4);

        let result = retrier.run(failing_until(counters.attempts.clone(), u32::MAX)).await;

        assert_err!(&result);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(counters.retries.load(Ordering::SeqCst), 4);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_write_has_its_own_budget() {
        let (retrier, counters) = retrier(2);

        for _ in 0..3 {
            let _ = retrier.run(failing_until(counters.attempts.clone(), u32::MAX)).await;
        }

        assert_eq!(counters.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_retry_keeps_trying() {
        let (retrier, counters) = retrier(0);

        let result = retrier.run(failing_until(counters.attempts.clone(), 50)).await;

        assert_eq!(assert_ok!(result), 50);
        assert_eq!(counters.retries.load(Ordering::SeqCst), 49);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 0);
    }
}
