use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

use crate::config::EngineConfig;
use crate::providers::HttpStatusError;

/// Bounded retry with exponential backoff, applied independently at every
/// stage's call boundary.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub retries: usize,
    pub delay: Duration,
    pub backoff: f64,
    pub retry_on: fn(&anyhow::Error) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(1000),
            backoff: 2.0,
            retry_on: default_retry_on,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retries: config.retries,
            delay: config.retry_delay,
            backoff: config.retry_backoff,
            retry_on: default_retry_on,
        }
    }

    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }
}

/// Retry 429 and 5xx; never retry other 4xx. Errors without a recognizable
/// HTTP shape (connect resets, timeouts, anything opaque) are retried.
pub fn default_retry_on(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<HttpStatusError>() {
        Some(status) => status.status == 429 || status.status >= 500,
        None => true,
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted, waiting
/// `delay * backoff^attempt` between attempts. A rate-limit retry-after
/// hint overrides the computed wait to `max(computed, hint + 500ms)`.
/// Exhaustion re-raises the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: usize = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.retries || !(policy.retry_on)(&err) {
                    return Err(err);
                }
                let mut wait = policy.delay.mul_f64(policy.backoff.powi(attempt as i32));
                if let Some(hint) = err
                    .downcast_ref::<HttpStatusError>()
                    .and_then(|status| status.retry_after)
                {
                    wait = wait.max(hint + Duration::from_millis(500));
                }
                sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use tokio::time::Instant;

    use super::*;

    fn status_error(status: u16, retry_after: Option<Duration>) -> anyhow::Error {
        HttpStatusError {
            provider: "test".to_string(),
            status,
            retry_after,
            body: String::new(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&RetryPolicy::default(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(status_error(503, None))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status_error(400, None)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_shaped_errors_are_retried_until_exhaustion() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            retries: 2,
            ..RetryPolicy::default()
        };
        let result: Result<()> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { bail!("connection reset by peer") }
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("connection reset"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_shorter_backoff() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            retries: 1,
            delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        let started = Instant::now();
        let result = with_retry(&policy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(status_error(429, Some(Duration::from_secs(4))))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        // hint (4s) + 500ms margin beats delay * backoff^0 = 100ms
        assert!(started.elapsed() >= Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            retries: 2,
            delay: Duration::from_millis(1000),
            backoff: 2.0,
            retry_on: default_retry_on,
        };
        let started = Instant::now();
        let _: Result<()> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status_error(500, None)) }
        })
        .await;
        // 1000ms + 2000ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }
}
