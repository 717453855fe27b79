// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-windowed cache with coalesced expiry.
//!
//! Every entry lives for the same TTL, so insertion order is also expiry
//! order. Instead of one timer per key, a single timer is armed for
//! `ttl + buffer` when the cache goes from idle to non-empty. When it fires it
//! evicts every entry whose deadline has passed, then re-arms for the oldest
//! survivor (again plus the buffer), so near-simultaneous insertions expire in
//! one batch.
//!
//! Re-setting a key keeps its original deadline: the key is evicted on the
//! schedule of its first insertion. Callers insert each logical key once.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default slack added to every expiry timer.
pub const EXPIRY_BUFFER: Duration = Duration::from_millis(500);

struct CacheState<K, V> {
    entries: HashMap<K, V>,
    /// `(deadline, key)` in insertion order.
    queue: VecDeque<(Instant, K)>,
    timer: Option<JoinHandle<()>>,
}

/// Mapping whose entries expire `ttl` after insertion.
///
/// Must be used from within a tokio runtime (the expiry timer is a task).
pub struct ExpiryWindowCache<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    ttl: Duration,
    buffer: Duration,
}

impl<K, V> ExpiryWindowCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache with the default buffer.
    pub fn new(ttl: Duration) -> Self {
        Self::with_buffer(ttl, EXPIRY_BUFFER)
    }

    /// Create a cache with an explicit timer buffer.
    pub fn with_buffer(ttl: Duration, buffer: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                queue: VecDeque::new(),
                timer: None,
            })),
            ttl,
            buffer,
        }
    }

    /// Insert or overwrite `key`. A fresh key expires `ttl` from now.
    pub fn set(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.entries.insert(key.clone(), value);
        state.queue.push_back((Instant::now() + self.ttl, key));

        if state.timer.is_none() {
            let delay = self.ttl + self.buffer;
            state.timer = Some(spawn_timer(Arc::downgrade(&self.state), delay, self.buffer));
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn has(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Time-to-live of every entry.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True while an expiry timer is pending.
    pub fn timer_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Drop every entry and cancel the pending timer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.queue.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

fn spawn_timer<K, V>(
    state: Weak<Mutex<CacheState<K, V>>>,
    first_delay: Duration,
    buffer: Duration,
) -> JoinHandle<()>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;

            let Some(shared) = state.upgrade() else {
                return;
            };
            let mut state = shared.lock();
            let now = Instant::now();

            let mut evicted = 0usize;
            while state.queue.front().is_some_and(|(deadline, _)| *deadline <= now) {
                if let Some((_, key)) = state.queue.pop_front() {
                    if state.entries.remove(&key).is_some() {
                        evicted += 1;
                    }
                }
            }
            if evicted > 0 {
                tracing::trace!("expiry window evicted {} entries", evicted);
            }

            match state.queue.front() {
                Some((deadline, _)) => {
                    delay = deadline.saturating_duration_since(now) + buffer;
                }
                None => {
                    state.timer = None;
                    return;
                }
            }
        }
    })
}

impl<K, V> Drop for ExpiryWindowCache<K, V> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }
}

impl<K, V> fmt::Debug for ExpiryWindowCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExpiryWindowCache")
            .field("ttl", &self.ttl)
            .field("buffer", &self.buffer)
            .field("len", &state.entries.len())
            .field("timer_armed", &state.timer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Move the paused clock to `start + ms` and let the timer task run.
    async fn advance_to(start: Instant, ms: u64) {
        let target = start + Duration::from_millis(ms);
        let now = Instant::now();
        if target > now {
            tokio::time::advance(target - now).await;
        }
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_expiry_schedule() {
        let cache = ExpiryWindowCache::new(Duration::from_millis(2000));
        let start = Instant::now();

        cache.set("a", 0);
        advance_to(start, 1000).await;
        cache.set("b", 1);
        advance_to(start, 1900).await;
        cache.set("c", 2);

        advance_to(start, 2499).await;
        assert_eq!(cache.len(), 3, "nothing expires before ttl + buffer");

        advance_to(start, 2500).await;
        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));
        assert!(cache.has(&"c"));

        // re-armed for b: (3000 - 2500) + 500 -> fires at 3500
        advance_to(start, 3499).await;
        assert!(cache.has(&"b"));
        advance_to(start, 3500).await;
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"c"));

        // re-armed for c: (3900 - 3500) + 500 -> fires at 4400
        advance_to(start, 4400).await;
        assert!(cache.is_empty());
        assert!(!cache.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_timer_for_many_keys() {
        let cache = ExpiryWindowCache::new(Duration::from_millis(100));
        let start = Instant::now();
        for i in 0..50u64 {
            cache.set(i, i * 2);
        }
        assert!(cache.timer_armed());
        assert_eq!(cache.get(&10), Some(20));

        advance_to(start, 600).await;
        assert!(cache.is_empty());
        assert!(!cache.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_keeps_first_deadline() {
        let cache = ExpiryWindowCache::new(Duration::from_millis(1000));
        let start = Instant::now();
        cache.set("k", "first");
        advance_to(start, 900).await;
        cache.set("k", "second");
        assert_eq!(cache.get(&"k"), Some("second"));

        advance_to(start, 1500).await;
        assert!(!cache.has(&"k"), "expires on its first-insertion schedule");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_idle() {
        let cache = ExpiryWindowCache::with_buffer(Duration::from_millis(100), Duration::ZERO);
        let start = Instant::now();
        cache.set(1u64, ());
        advance_to(start, 100).await;
        assert!(cache.is_empty());
        assert!(!cache.timer_armed());

        cache.set(2u64, ());
        assert!(cache.timer_armed());
        advance_to(start, 199).await;
        assert!(cache.has(&2));
        advance_to(start, 200).await;
        assert!(!cache.has(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_timer() {
        let cache = ExpiryWindowCache::new(Duration::from_millis(100));
        cache.set("x", 1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.timer_armed());
    }
}
