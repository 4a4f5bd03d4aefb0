//! Deduplicating, rate-limited work queue
//!
//! Items move through three sets:
//! - `dirty`: waiting to be processed (at most one pending entry per item)
//! - `processing`: handed out by [`WorkQueue::get`] and not yet [`WorkQueue::done`]
//! - `waiting`: scheduled by [`WorkQueue::add_after`] for a future add
//!
//! An item added while it is processing stays dirty and is queued again when
//! the worker calls `done`, so the same item is never processed concurrently.

mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimitConfig, RateLimiter,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Bounds for items stored in a [`WorkQueue`]
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

/// A deduplicating FIFO with per-item rate limiting
pub struct WorkQueue<T: QueueItem> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

impl<T: QueueItem> WorkQueue<T> {
    /// Create a named queue using the given rate limiter for retries
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue name (used in logs)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers drain the backlog
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished; re-queues it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has elapsed
    ///
    /// Only the earliest pending deadline per item is kept.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(item.clone(), ready_at);
                }
            }
        }

        trace!(queue = %self.name, ?item, ?delay, "scheduling delayed add");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep_until(ready_at) => queue.add_ready(item, ready_at),
            }
        });
    }

    fn add_ready(&self, item: T, ready_at: Instant) {
        {
            let mut state = self.lock();
            match state.waiting.get(&item) {
                Some(deadline) if *deadline == ready_at => {
                    state.waiting.remove(&item);
                }
                // Superseded by an earlier deadline that already fired or will fire
                _ => return,
            }
        }
        self.add(item);
    }

    /// Add `item` after the delay chosen by the rate limiter
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the rate limiter's state for `item`
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Number of times `item` has been rate limited since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Number of items ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no items are ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and release every blocked [`WorkQueue::get`]
    ///
    /// Pending delayed adds are dropped. Items still queued are drained by
    /// `get` before it starts returning `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
