//! Bounded TTL cache for inbound-event deduplication.
//!
//! The cache is advisory only: it saves a durable-store round trip for keys
//! seen recently on this process. The processed-events table remains the
//! source of truth for correctness.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

pub struct TtlCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    ttl: Duration,
}

struct CacheInner {
    entries: HashMap<String, Instant>,
    // Insertion order; with a uniform TTL the front is always the oldest.
    order: VecDeque<String>,
}

impl TtlCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        assert!(max_size > 0, "cache capacity must be nonzero");
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size,
            ttl,
        }
    }

    /// Record a key with the current timestamp.
    ///
    /// When the insert would exceed capacity, an oldest batch (10% of
    /// capacity, at least one entry) is evicted first.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let now = Instant::now();

        Self::drop_expired(&mut inner, now, self.ttl);

        if let Some(timestamp) = inner.entries.get_mut(key) {
            *timestamp = now;
            return;
        }

        if inner.entries.len() >= self.max_size {
            let batch = (self.max_size / 10).max(1);
            let mut evicted = 0;
            while evicted < batch {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if inner.entries.remove(&oldest).is_some() {
                    evicted += 1;
                }
            }
            info!("Dedup cache at capacity, evicted {} oldest entries", evicted);
        }

        inner.entries.insert(key.to_string(), now);
        inner.order.push_back(key.to_string());
        debug!("Added key to dedup cache: {}", key);
    }

    /// Check whether a key is present and not expired.
    ///
    /// Expired entries are removed on read.
    pub fn contains(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("mutex poisoned");

        let Some(inserted_at) = inner.entries.get(key).copied() else {
            return false;
        };

        if inserted_at.elapsed() > self.ttl {
            inner.entries.remove(key);
            debug!("Dedup cache key expired: {}", key);
            return false;
        }

        true
    }

    /// Drop a key, if present. The stale order slot is discarded lazily by
    /// `drop_expired`.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drop_expired(inner: &mut CacheInner, now: Instant, ttl: Duration) {
        loop {
            let Some(front) = inner.order.front() else {
                break;
            };
            // A missing entry is a stale order slot left behind by an
            // explicit remove or an expiry on read; discard and keep going.
            let expired = match inner.entries.get(front) {
                Some(inserted_at) => now.duration_since(*inserted_at) > ttl,
                None => true,
            };
            if !expired {
                break;
            }
            let key = inner.order.pop_front().expect("front checked above");
            inner.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let cache = TtlCache::new(10, Duration::from_secs(60));
        cache.add("ev-1");
        assert!(cache.contains("ev-1"));
        assert!(!cache.contains("ev-2"));
    }

    #[test]
    fn expired_entries_are_not_reported() {
        let cache = TtlCache::new(10, Duration::from_millis(10));
        cache.add("ev-1");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.contains("ev-1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest_batch() {
        let cache = TtlCache::new(10, Duration::from_secs(60));
        for i in 0..10 {
            cache.add(&format!("ev-{}", i));
        }
        assert_eq!(cache.len(), 10);

        // The insert that would exceed capacity evicts 10% of capacity.
        cache.add("ev-10");
        assert_eq!(cache.len(), 10);
        assert!(!cache.contains("ev-0"));
        assert!(cache.contains("ev-9"));
        assert!(cache.contains("ev-10"));
    }

    #[test]
    fn re_adding_a_key_refreshes_without_duplicating() {
        let cache = TtlCache::new(3, Duration::from_secs(60));
        cache.add("ev-1");
        cache.add("ev-1");
        cache.add("ev-2");
        cache.add("ev-3");
        assert_eq!(cache.len(), 3);
        assert!(cache.contains("ev-1"));
    }
}
