use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Spaces dispatches to the shared model backend: no two throttled
/// operations start less than `min_interval` apart. The last-dispatch
/// timestamp is the only shared mutable state; holding the lock through the
/// spacing sleep gives FIFO ordering by arrival at the await, and nothing
/// stronger.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    pub async fn throttle<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        {
            let mut last = self.last_dispatch.lock().await;
            if let Some(previous) = *last {
                let since = previous.elapsed();
                if since < self.min_interval {
                    sleep(self.min_interval - since).await;
                }
            }
            // Stamped just before dispatch, while still holding the lock.
            *last = Some(Instant::now());
        }
        operation.await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn consecutive_dispatches_are_spaced_by_min_interval() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(2500)));

        let start = Instant::now();
        let first = limiter.throttle(async { Instant::now() }).await;
        let second = limiter.throttle(async { Instant::now() }).await;
        let third = limiter.throttle(async { Instant::now() }).await;

        assert!(first - start < Duration::from_millis(10));
        assert!(second - first >= Duration::from_millis(2500));
        assert!(third - second >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_serialize_through_the_limiter() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(1000)));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            tasks.push(tokio::spawn(async move {
                limiter.throttle(async { Instant::now() }).await
            }));
        }
        let mut starts = Vec::new();
        for task in tasks {
            starts.push(task.await.expect("join"));
        }
        starts.sort();
        assert!(starts[1] - starts[0] >= Duration::from_millis(1000));
        assert!(starts[2] - starts[1] >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn zero_interval_is_a_no_op() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let value = limiter.throttle(async { 7 }).await;
        assert_eq!(value, 7);
    }
}
