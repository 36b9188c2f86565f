//! Token bucket rate limiter keyed by (account, exchange).
//!
//! Every outbound call for an account on an exchange goes through one bucket,
//! so concurrent steps for the same account share the budget. A bucket also
//! enforces a minimum spacing between calls and can be blocked for a while
//! after the exchange answered with a rate-limit error.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::adapter::RateLimit;

/// Bucket key for an account on an exchange.
pub fn limiter_key(account_id: &str, exchange_id: &str) -> String {
    format!("{account_id}:{exchange_id}")
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    /// Tokens per second.
    rate: f64,
    capacity: f64,
    min_interval: Duration,
    last_grant: Option<Instant>,
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    fn with_config(config: &RateLimit) -> Self {
        let capacity = config.burst_capacity.max(1.0);
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: f64::from(config.requests_per_minute.max(1)) / 60.0,
            capacity,
            min_interval: config.min_interval,
            last_grant: None,
            blocked_until: None,
        }
    }

    /// Nothing accrues before `last_update`, which a penalty moves into the
    /// future.
    fn refill(&mut self) {
        let now = Instant::now();
        if now <= self.last_update {
            return;
        }
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    /// Zero when a call may go out now, otherwise how long to wait.
    fn time_until_available(&mut self) -> Duration {
        self.refill();
        let now = Instant::now();

        let blocked = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let spacing = self
            .last_grant
            .map(|last| (last + self.min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let refill = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        };

        blocked.max(spacing).max(refill)
    }

    fn try_acquire(&mut self) -> bool {
        if self.time_until_available() > Duration::ZERO {
            return false;
        }
        self.tokens -= 1.0;
        self.last_grant = Some(Instant::now());
        self.blocked_until = None;
        true
    }
}

/// Thread-safe limiter holding one bucket per key.
///
/// Buckets are created on first use from the configured [`RateLimit`] for
/// the key, or from `RateLimit::default()`.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    configs: Mutex<HashMap<String, RateLimit>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the buckets, recovering from poison. A poisoned limiter at worst
    /// paces a few calls wrongly.
    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter buckets mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_configs(&self) -> MutexGuard<'_, HashMap<String, RateLimit>> {
        self.configs.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter configs mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Configure the limit for `key`. An existing bucket is kept when the
    /// limit is unchanged so that concurrent runs do not reset each other.
    pub fn configure(&self, key: &str, config: RateLimit) {
        let mut configs = self.lock_configs();
        if configs.get(key) == Some(&config) {
            return;
        }
        configs.insert(key.to_string(), config);
        drop(configs);

        self.lock_buckets().remove(key);
    }

    /// Wait until a call for `key` may go out.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait_time = {
                let mut buckets = self.lock_buckets();
                let bucket = buckets
                    .entry(key.to_string())
                    .or_insert_with(|| self.create_bucket(key));

                if bucket.try_acquire() {
                    return;
                }
                bucket.time_until_available()
            };

            if wait_time > Duration::ZERO {
                debug!("Rate limiter: waiting {:?} for '{}'", wait_time, key);
                tokio::time::sleep(wait_time).await;
            }
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let mut buckets = self.lock_buckets();
        buckets
            .entry(key.to_string())
            .or_insert_with(|| self.create_bucket(key))
            .try_acquire()
    }

    /// Block `key` for `delay` after the exchange throttled it. The bucket is
    /// drained and refills only from the end of the block, so calls resume at
    /// the steady rate.
    pub fn penalize(&self, key: &str, delay: Duration) {
        let mut buckets = self.lock_buckets();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| self.create_bucket(key));

        let until = Instant::now() + delay;
        let until = bucket.blocked_until.map_or(until, |current| current.max(until));
        bucket.blocked_until = Some(until);
        bucket.tokens = 0.0;
        bucket.last_update = bucket.last_update.max(until);
        debug!("Rate limiter: '{}' blocked for {:?}", key, delay);
    }

    pub fn remaining_tokens(&self, key: &str) -> f64 {
        let mut buckets = self.lock_buckets();
        match buckets.get_mut(key) {
            Some(bucket) => {
                bucket.refill();
                bucket.tokens
            }
            None => self.config_for(key).burst_capacity,
        }
    }

    pub fn reset(&self, key: &str) {
        self.lock_buckets().remove(key);
    }

    fn config_for(&self, key: &str) -> RateLimit {
        self.lock_configs().get(key).cloned().unwrap_or_default()
    }

    fn create_bucket(&self, key: &str) -> TokenBucket {
        TokenBucket::with_config(&self.config_for(key))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unspaced(rpm: u32, burst: f64) -> RateLimit {
        RateLimit {
            requests_per_minute: rpm,
            burst_capacity: burst,
            min_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_token_bucket_acquire() {
        let mut bucket = TokenBucket::with_config(&unspaced(60, 3.0));
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::with_config(&unspaced(60, 1.0));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        bucket.last_update = Instant::now() - Duration::from_secs(2);
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_min_interval_spaces_calls() {
        let mut bucket = TokenBucket::with_config(&RateLimit {
            requests_per_minute: 6000,
            burst_capacity: 10.0,
            min_interval: Duration::from_secs(5),
        });
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(bucket.time_until_available() > Duration::from_secs(4));
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::new();
        let a = limiter_key("acct-1", "BINANCE");
        let b = limiter_key("acct-2", "BINANCE");
        limiter.configure(&a, unspaced(60, 2.0));
        limiter.configure(&b, unspaced(60, 2.0));

        assert!(limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&a));
        assert!(!limiter.try_acquire(&a));
        assert!(limiter.try_acquire(&b));
    }

    #[test]
    fn test_penalize_blocks_until_delay_elapses() {
        let limiter = RateLimiter::new();
        let key = limiter_key("acct", "BYBIT");
        limiter.configure(&key, unspaced(6000, 10.0));

        limiter.penalize(&key, Duration::from_secs(30));
        assert!(!limiter.try_acquire(&key));
        assert_eq!(limiter.remaining_tokens(&key), 0.0);
    }

    #[tokio::test]
    async fn test_penalty_does_not_refill_while_blocked() {
        let limiter = RateLimiter::new();
        let key = limiter_key("acct", "BYBIT");
        // 100 tokens per second.
        limiter.configure(&key, unspaced(6000, 10.0));

        let start = Instant::now();
        limiter.penalize(&key, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.remaining_tokens(&key), 0.0);
        assert!(!limiter.try_acquire(&key));

        limiter.acquire(&key).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_reconfigure_with_same_limit_keeps_bucket() {
        let limiter = RateLimiter::new();
        let key = limiter_key("acct", "BINANCE");
        limiter.configure(&key, unspaced(60, 1.0));
        assert!(limiter.try_acquire(&key));

        limiter.configure(&key, unspaced(60, 1.0));
        assert!(!limiter.try_acquire(&key));

        limiter.reset(&key);
        assert!(limiter.try_acquire(&key));
    }

    #[tokio::test]
    async fn test_async_acquire_waits() {
        let limiter = RateLimiter::new();
        let key = limiter_key("acct", "BINANCE");
        limiter.configure(&key, unspaced(6000, 2.0));

        limiter.acquire(&key).await;
        limiter.acquire(&key).await;

        let start = Instant::now();
        limiter.acquire(&key).await;
        assert!(start.elapsed().as_millis() >= 5);
    }
}
