//! Runtime settings for the controller

use std::time::Duration;

use crate::queue::RateLimitConfig;

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 1;

/// Default period between informer resyncs
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Settings for the informers, queue and workers
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers (at least one is started)
    pub workers: usize,
    /// How often every cached object is replayed as an update; zero disables it
    pub resync_period: Duration,
    /// How long to wait for the caches before starting workers anyway;
    /// `None` waits until they sync or shutdown is requested
    pub cache_sync_timeout: Option<Duration>,
    /// Retry pacing for failed keys
    pub rate_limit: RateLimitConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
            cache_sync_timeout: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Set the worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the resync period
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Set the cache-sync timeout
    pub fn cache_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }
}
