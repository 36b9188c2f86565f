//! Exponential backoff shared by every adapter call.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use super::rate_limiter::RateLimiter;
use crate::adapter::ExchangeAdapter;
use crate::errors::{ExchangeError, RetryClass};

/// Retry policy for adapter calls.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay, before any `retry_after` hint.
    pub max_delay: Duration,
    /// Retries after the first attempt. A clock resync retry is not counted.
    pub max_retries: u32,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && delay > Duration::ZERO {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Run `op` under the limiter for `key`, retrying per `policy`.
///
/// - `WithBackoff` errors are retried up to `max_retries` times. A
///   `retry_after` hint raises the wait to at least that delay and blocks the
///   limiter key for the same time.
/// - The first `ResyncClock` error triggers `adapter.sync_clock()` and one
///   uncounted retry; later ones back off like transient errors.
/// - Everything else is returned immediately.
///
/// After the retries are used up the last error is returned.
pub async fn call_with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    limiter: &RateLimiter,
    key: &str,
    adapter: &dyn ExchangeAdapter,
    op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    retry_loop(policy, adapter.id(), Some((limiter, key)), Some(adapter), op).await
}

/// [`call_with_retry`] for sources outside any exchange account, such as a
/// price oracle. Nothing is paced and clock skew backs off like a transient
/// error.
pub async fn call_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    source: &str,
    op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    retry_loop(policy, source, None, None, op).await
}

async fn retry_loop<T, F, Fut>(
    policy: &BackoffPolicy,
    source: &str,
    limiter: Option<(&RateLimiter, &str)>,
    adapter: Option<&dyn ExchangeAdapter>,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0u32;
    let mut resynced = false;

    loop {
        if let Some((limiter, key)) = limiter {
            limiter.acquire(key).await;
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match (err.retry_class(), adapter) {
            (RetryClass::ResyncClock, Some(adapter)) if !resynced => {
                resynced = true;
                warn!("{}: clock skew rejected, resyncing clock", source);
                if let Err(sync_err) = adapter.sync_clock().await {
                    warn!("{}: clock resync failed: {}", source, sync_err);
                }
            }
            (RetryClass::WithBackoff | RetryClass::ResyncClock, _) => {
                if attempt >= policy.max_retries {
                    warn!("{}: giving up after {} retries: {}", source, attempt, err);
                    return Err(err);
                }

                let mut delay = policy.delay_for(attempt);
                if let ExchangeError::RateLimited { retry_after, .. } = &err {
                    if let Some(hint) = retry_after {
                        delay = delay.max(*hint);
                    }
                    if let Some((limiter, key)) = limiter {
                        limiter.penalize(key, delay);
                    }
                }
                attempt += 1;
                debug!(
                    "{}: retry {}/{} in {:?} after: {}",
                    source, attempt, policy.max_retries, delay, err
                );
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
            }
            (RetryClass::Never | RetryClass::NextTier, _) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterCapabilities, RateLimit};
    use crate::models::{RawRecord, RecordFields};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct ClockAdapter {
        syncs: AtomicU32,
    }

    #[async_trait]
    impl ExchangeAdapter for ClockAdapter {
        fn id(&self) -> &'static str {
            "TEST"
        }

        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities::new(chrono::Duration::days(30))
        }

        async fn sync_clock(&self) -> Result<(), ExchangeError> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn extract(&self, record: &RawRecord) -> Result<RecordFields, ExchangeError> {
            Err(ExchangeError::malformed_record(record.exchange.as_str(), "unused"))
        }
    }

    fn open_limiter() -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.configure(
            "acct:TEST",
            RateLimit {
                requests_per_minute: 60_000,
                burst_capacity: 100.0,
                min_interval: Duration::ZERO,
            },
        );
        limiter
    }

    fn rate_limited() -> ExchangeError {
        ExchangeError::RateLimited {
            exchange: "TEST".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_retries: 5,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn test_retries_rate_limit_until_success() {
        let adapter = ClockAdapter::default();
        let limiter = open_limiter();
        let calls = Arc::new(AtomicU32::new(0));

        let result = call_with_retry(
            &BackoffPolicy::immediate(3),
            &limiter,
            "acct:TEST",
            &adapter,
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(rate_limited())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let adapter = ClockAdapter::default();
        let limiter = open_limiter();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = call_with_retry(
            &BackoffPolicy::immediate(2),
            &limiter,
            "acct:TEST",
            &adapter,
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited())
                }
            },
        )
        .await;

        assert!(matches!(result, Err(ExchangeError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clock_skew_resyncs_once_without_counting() {
        let adapter = ClockAdapter::default();
        let limiter = open_limiter();
        let calls = Arc::new(AtomicU32::new(0));

        let result = call_with_retry(
            &BackoffPolicy::immediate(0),
            &limiter,
            "acct:TEST",
            &adapter,
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ExchangeError::ClockSkew {
                            exchange: "TEST".to_string(),
                            message: "timestamp outside recvWindow".to_string(),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(adapter.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unpaced_backoff_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = call_with_backoff(&BackoffPolicy::immediate(2), "ORACLE", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::TransientNetwork {
                        exchange: "ORACLE".to_string(),
                        message: "HTTP 503".to_string(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = call_with_backoff(&BackoffPolicy::immediate(2), "ORACLE", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::InvalidRequest {
                    exchange: "ORACLE".to_string(),
                    message: "HTTP 404".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::InvalidRequest { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_not_retried() {
        let adapter = ClockAdapter::default();
        let limiter = open_limiter();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = call_with_retry(
            &BackoffPolicy::immediate(5),
            &limiter,
            "acct:TEST",
            &adapter,
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::AuthRejected {
                        exchange: "TEST".to_string(),
                        message: "Invalid API-key".to_string(),
                    })
                }
            },
        )
        .await;

        assert!(matches!(result, Err(ExchangeError::AuthRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
