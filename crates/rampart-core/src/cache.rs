//! Size-weighted LRU key/value cache.
//!
//! The datalake stores all of its state through this cache: policies,
//! assets, queries, score and data slots, and resolved policies. Entries
//! carry a caller-assigned weight; when the sum of weights exceeds the
//! configured maximum, least-recently-used entries are evicted until the new
//! entry fits. Admission can fail — a [`KvCache::set`] whose weight exceeds
//! the cache maximum returns `false`, and callers surface that as an
//! `Unavailable` error rather than dropping the write silently.
//!
//! # Concurrency
//!
//! `get`, `set`, and `delete` are individually atomic (a single mutex guards
//! the map and the recency queue). The cache deliberately provides no
//! compare-and-swap; higher layers deal with concurrent mutation through
//! whole-value writes and a retry envelope.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::trace;

struct Entry<V> {
    value: V,
    weight: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    recency: VecDeque<String>,
    total_weight: u64,
}

/// A size-weighted LRU cache with atomic get/set/delete.
pub struct KvCache<V> {
    inner: Mutex<Inner<V>>,
    max_weight: u64,
}

impl<V: Clone> KvCache<V> {
    /// Creates a cache that holds at most `max_weight` total entry weight.
    #[must_use]
    pub fn new(max_weight: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                total_weight: 0,
            }),
            max_weight,
        }
    }

    /// Returns a clone of the value stored at `key` and marks it
    /// recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if !inner.entries.contains_key(key) {
            return None;
        }
        touch(&mut inner.recency, key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Stores `value` under `key` with the given weight.
    ///
    /// Returns `false` if the entry cannot be admitted (its weight exceeds
    /// the cache maximum). Replacing an existing key adjusts the total
    /// weight before eviction runs, so a replace can never evict itself.
    pub fn set(&self, key: &str, value: V, weight: u64) -> bool {
        if weight > self.max_weight {
            return false;
        }

        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        if let Some(old) = inner.entries.remove(key) {
            inner.total_weight -= old.weight;
            remove_key(&mut inner.recency, key);
        }

        inner.total_weight += weight;
        inner.recency.push_back(key.to_string());
        inner.entries.insert(key.to_string(), Entry { value, weight });

        while inner.total_weight > self.max_weight {
            let Some(victim) = inner.recency.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.total_weight -= evicted.weight;
                trace!(key = %victim, weight = evicted.weight, "cache evict");
            }
        }

        true
    }

    /// Removes the entry at `key`, if present.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if let Some(old) = inner.entries.remove(key) {
            inner.total_weight -= old.weight;
            remove_key(&mut inner.recency, key);
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the weights of all held entries.
    pub fn total_weight(&self) -> u64 {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .total_weight
    }
}

fn touch(recency: &mut VecDeque<String>, key: &str) {
    remove_key(recency, key);
    recency.push_back(key.to_string());
}

fn remove_key(recency: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = recency.iter().position(|k| k == key) {
        recency.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let cache: KvCache<String> = KvCache::new(10);
        assert!(cache.set("a", "one".to_string(), 1));
        assert_eq!(cache.get("a"), Some("one".to_string()));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn oversized_entry_is_refused() {
        let cache: KvCache<u32> = KvCache::new(4);
        assert!(!cache.set("big", 1, 5));
        assert_eq!(cache.get("big"), None);
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let cache: KvCache<u32> = KvCache::new(3);
        assert!(cache.set("a", 1, 1));
        assert!(cache.set("b", 2, 1));
        assert!(cache.set("c", 3, 1));

        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get("a"), Some(1));

        assert!(cache.set("d", 4, 1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.get("d"), Some(4));
    }

    #[test]
    fn replace_adjusts_weight() {
        let cache: KvCache<u32> = KvCache::new(4);
        assert!(cache.set("a", 1, 2));
        assert!(cache.set("a", 2, 3));
        assert_eq!(cache.total_weight(), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn heavy_insert_evicts_lighter_entries() {
        let cache: KvCache<u32> = KvCache::new(4);
        assert!(cache.set("a", 1, 1));
        assert!(cache.set("b", 2, 1));
        assert!(cache.set("c", 3, 4));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn delete_releases_weight() {
        let cache: KvCache<u32> = KvCache::new(2);
        assert!(cache.set("a", 1, 2));
        cache.delete("a");
        assert!(cache.is_empty());
        assert_eq!(cache.total_weight(), 0);
        assert!(cache.set("b", 2, 2));
    }
}
