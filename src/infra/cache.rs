//! Bounded FIFO cache shared across sessions
//!
//! Eviction is insertion-order: once `capacity` entries are resident the
//! oldest inserted key is dropped. Reads never promote an entry and entries
//! never expire by time.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;

struct CacheInner<K, V> {
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
}

/// Mutex-guarded bounded map with oldest-first eviction
pub struct BoundedCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: FxHashMap::default(),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().map.get(key).cloned()
    }

    /// Insert a value. Re-inserting a resident key replaces the value
    /// without changing its eviction position.
    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.map.get_mut(&key) {
            *slot = value;
            return;
        }
        while inner.map.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.map.insert(key, value);
    }

    /// Return the cached value or compute, insert, and return it.
    ///
    /// `compute` runs outside the lock; it must be a pure function of the key.
    pub fn get_or_insert_with(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(&key) {
            return hit;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_first() {
        let cache = BoundedCache::new(3);
        for i in 0..5 {
            cache.insert(i, i * 10);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&0));
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&4), Some(40));
    }

    #[test]
    fn test_reads_do_not_promote() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // A true LRU would keep "a" after this read
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 100);
        assert_eq!(cache.len(), 2);
        cache.insert("c", 3);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let cache = BoundedCache::new(4);
        let mut calls = 0;
        let v1 = cache.get_or_insert_with(7, || {
            calls += 1;
            49
        });
        let v2 = cache.get_or_insert_with(7, || {
            calls += 1;
            0
        });
        assert_eq!((v1, v2), (49, 49));
        assert_eq!(calls, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let cache = BoundedCache::new(0);
        cache.insert(1, 1);
        assert!(cache.is_empty());
    }
}
