//! Rate limiters deciding how long a failed item waits before redelivery

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Decides the delay before an item is handed out again
pub trait RateLimiter<T>: Send + Sync {
    /// Record a failure for `item` and return how long it must wait
    fn when(&self, item: &T) -> Duration;

    /// Clear any per-item state (called after a success)
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T> {
    failures: DashMap<T, u32>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Eq + Hash> ItemExponentialFailureRateLimiter<T> {
    /// Create a limiter with the given base and maximum delay
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base_delay,
            max_delay,
        }
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(item.clone()).or_insert(0);
            let exp = *entry;
            *entry = exp.saturating_add(1);
            exp
        };

        // 2^exp overflows long before the cap matters
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map_or(0, |n| *n)
    }
}

/// Token bucket shared by all items, bounding the overall retry rate
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Reserve one token and return how long until it becomes available
    fn reserve(&self) -> Duration {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest of them
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Tunables for [`default_controller_rate_limiter`]
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    /// Delay after the first failure of an item
    pub base_delay: Duration,
    /// Upper bound for per-item backoff
    pub max_delay: Duration,
    /// Sustained retries per second across all items
    pub qps: f64,
    /// Retries allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Per-item exponential backoff combined with an overall token bucket
pub fn default_controller_rate_limiter<T>(config: &RateLimitConfig) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
