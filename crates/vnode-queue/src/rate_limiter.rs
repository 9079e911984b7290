//! Rate limiters deciding how long a key waits before it becomes ready
//!
//! The queue asks [`RateLimiter::when`] every time a key is enqueued through
//! the rate-limited path or retried after a failure, and calls
//! [`RateLimiter::forget`] once the key is handled successfully.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Per-key delay policy
pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed; records one more requeue
    fn when(&self, key: &str) -> Duration;
    /// Clear all state held for `key`
    fn forget(&self, key: &str);
    /// Number of times `key` has been requeued since it was last forgotten
    fn num_requeues(&self, key: &str) -> u32;
}

/// Default base delay for per-key exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default cap for per-key exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Default overall rate for the token bucket
pub const DEFAULT_QPS: f64 = 10.0;
/// Default burst size for the token bucket
pub const DEFAULT_BURST: u32 = 100;

/// `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    /// Create a limiter with the given base and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };
        let backoff = 2u32
            .checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor));
        match backoff {
            Some(delay) if delay < self.max => delay,
            _ => self.max,
        }
    }

    fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys
///
/// Each `when` reserves one token. When the bucket is empty the caller is
/// told how long until its reservation is covered.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` with room for `burst` tokens
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms..1000s) combined with a 10 qps / 100 burst bucket
pub fn default_rate_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ]))
}
