//! Capacity- and time-bounded LRU cache.
//!
//! Entries are evicted when the capacity overflows (least recently used
//! first) and when they outlive the configured TTL. Expiry is checked lazily
//! on access; [`TtlLruCache::purge_expired`] sweeps the whole cache.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted: Instant,
}

pub struct TtlLruCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlLruCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Entry<V>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, entry: &Entry<V>) -> bool {
        entry.inserted.elapsed() >= self.ttl
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a value, restarting its TTL.
    pub fn insert(&self, key: K, value: V) {
        self.lock().put(key, Entry { value, inserted: Instant::now() });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.lock();
        let expired = match cache.get(key) {
            Some(entry) if !self.expired(entry) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let entry = self.lock().pop(key)?;
        if self.expired(&entry) {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Atomically read-modify-write the value under `key`, starting from
    /// `default` when the key is absent or expired. The TTL of an existing
    /// live entry is kept. Returns the stored value.
    pub fn upsert<F>(&self, key: K, default: V, update: F) -> V
    where
        F: FnOnce(&mut V),
    {
        let mut cache = self.lock();
        if cache.peek(&key).map(|e| self.expired(e)).unwrap_or(false) {
            cache.pop(&key);
        }
        let entry = cache.get_or_insert_mut(key, || Entry { value: default, inserted: Instant::now() });
        update(&mut entry.value);
        entry.value.clone()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.lock();
        let stale: Vec<K> = cache
            .iter()
            .filter(|(_, entry)| self.expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = TtlLruCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1)); // a is now most recent
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_ttl_expiry_on_access() {
        let cache = TtlLruCache::new(10, Duration::from_millis(20));
        cache.insert("a", 1);
        assert!(cache.contains(&"a"));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = TtlLruCache::new(10, Duration::from_millis(20));
        cache.insert("a", 1);
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("c", 3);
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_upsert_counts() {
        let cache = TtlLruCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.upsert("host", 0u32, |n| *n += 1), 1);
        assert_eq!(cache.upsert("host", 0u32, |n| *n += 1), 2);
        assert_eq!(cache.get(&"host"), Some(2));
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        let cache = Arc::new(TtlLruCache::new(10, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cache.upsert("host".to_string(), 0u32, |n| *n += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.get(&"host".to_string()), Some(800));
    }
}
