//! Deduplicating, rate-limited work queue
//!
//! A key is in at most one of two places: queued (waiting for a worker) or in
//! flight (held by a worker between `get` and `done`). Adding a key that is
//! already queued is a no-op; adding a key that is in flight marks it dirty so
//! it is queued again once the worker calls `done`. This gives per-key mutual
//! exclusion across workers without any other lock.

mod rate_limit;

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

pub use rate_limit::{
    DefaultRateLimiter, ExponentialBackoff, RateLimitConfig, RateLimiter, TokenBucket,
};

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while in flight
    dirty: HashSet<K>,
    /// Keys handed out by `get` and not yet `done`
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

/// Cloneable handle to a shared work queue
pub struct RetryQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RetryQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> RetryQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Queue using the default rate limiter
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_rate_limiter(DefaultRateLimiter::new(config))
    }

    /// Queue using a custom rate limiter
    pub fn with_rate_limiter(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Mark `key` as needing processing
    ///
    /// Returns false when the call changed nothing: the key was already
    /// pending or the queue is shutting down.
    pub fn add(&self, key: K) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by `done`
            return true;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue has been shut down and every queued key
    /// has been handed out. The caller must pass the key to [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            // Register before checking so a concurrent add or shutdown is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        drop(state);
                        // Pass the wakeup on; one permit may stand for several adds
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key obtained from [`get`](Self::get)
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-add `key` after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Re-add `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        trace!(delay_ms = delay.as_millis() as u64, "Scheduling delayed add");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the retry counter of `key`
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Stop accepting keys and wake every waiting worker
    ///
    /// Keys already queued are still handed out by `get`.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of queued keys, excluding those in flight
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
