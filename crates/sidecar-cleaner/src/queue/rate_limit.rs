//! Retry delay computation for the work queue
//!
//! Two limiters are combined: a per-key exponential backoff that grows with
//! consecutive failures, and a token bucket that caps the overall retry rate
//! so a burst of failing Pods cannot hammer the API server.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides how long a key waits before it is re-added
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return the delay before its retry
    fn when(&self, key: &K) -> Duration;

    /// Stop tracking `key`, resetting its backoff
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten
    fn num_requeues(&self, key: &K) -> u32;
}

/// Tuning for the default limiter
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on the per-key delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Sustained retries per second across all keys
    pub rate_per_second: f64,
    /// Retries allowed in a burst before the rate applies
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            rate_per_second: 10.0,
            burst: 100,
        }
    }
}

/// Per-key exponential backoff: `initial_delay * multiplier^failures`, capped
pub struct ExponentialBackoff<K> {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };

        let delay_nanos =
            self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent as i32);
        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(delay_nanos as u64)
        }
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

/// Overall token bucket; each retry takes a token, a deficit becomes a delay
pub struct TokenBucket {
    rate_per_second: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reserve one token and return how long until it is actually available
    pub fn reserve(&self) -> Duration {
        if self.rate_per_second <= 0.0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.burst);
        state.last_refill = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((-state.tokens * 1e9 / self.rate_per_second).round() as u64)
        }
    }
}

/// The controller default: the longer of per-key backoff and bucket delay
pub struct DefaultRateLimiter<K> {
    backoff: ExponentialBackoff<K>,
    bucket: TokenBucket,
}

impl<K: Eq + Hash + Clone> DefaultRateLimiter<K> {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                config.initial_delay,
                config.max_delay,
                config.backoff_multiplier,
            ),
            bucket: TokenBucket::new(config.rate_per_second, config.burst),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for DefaultRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.backoff.when(key).max(self.bucket.reserve())
    }

    fn forget(&self, key: &K) {
        self.backoff.forget(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.num_requeues(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure_and_caps() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_millis(100),
            2.0,
        );

        let delays: Vec<_> = (0..7).map(|_| backoff.when(&"a")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        assert_eq!(backoff.num_requeues(&"a"), 7);
    }

    #[test]
    fn backoff_is_tracked_per_key() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1), 2.0);
        backoff.when(&"a");
        backoff.when(&"a");

        assert_eq!(backoff.when(&"b"), Duration::from_millis(5));
        assert_eq!(backoff.num_requeues(&"a"), 2);
        assert_eq!(backoff.num_requeues(&"b"), 1);
    }

    #[test]
    fn forget_resets_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1), 2.0);
        backoff.when(&"a");
        backoff.when(&"a");
        backoff.forget(&"a");

        assert_eq!(backoff.num_requeues(&"a"), 0);
        assert_eq!(backoff.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn huge_failure_counts_stay_at_max_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000), 2.0);
        for _ in 0..5000 {
            assert!(backoff.when(&"a") <= Duration::from_secs(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_retries() {
        let bucket = TokenBucket::new(10.0, 2);

        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_millis(100));
        assert_eq!(bucket.reserve(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(10.0, 1);
        assert_eq!(bucket.reserve(), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_takes_the_longer_delay() {
        let config = RateLimitConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            rate_per_second: 1.0,
            burst: 1,
        };
        let limiter = DefaultRateLimiter::new(&config);

        // First retry: bucket has a token, backoff wins
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        // Second retry: bucket is empty, one token per second
        assert_eq!(limiter.when(&"b"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 1);
    }
}
