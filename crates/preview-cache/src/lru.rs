//! Byte-budgeted memory tier for rendered previews
//!
//! Evicts least-recently-used previews once their total size exceeds the
//! budget. The recency index is an ordered map keyed by an
//! access tick, so eviction does not scan the whole cache.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Entry<V> {
    value: V,
    byte_size: usize,
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    recency: BTreeMap<u64, K>,
    total_bytes: usize,
    max_bytes: usize,
    tick: u64,
}

impl<K: Clone + Hash + Eq, V: Clone> LruCache<K, V> {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                total_bytes: 0,
                max_bytes,
                tick: 0,
            }),
        }
    }

    /// Get a value, marking it most recently used
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().touch(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert a value, evicting old entries if the budget is exceeded.
    /// A value larger than the whole budget is not cached.
    pub fn insert(&self, key: K, value: V, byte_size: usize) {
        self.inner.lock().insert(key, value, byte_size);
    }

    /// Evict least-recently-used entries until at most `target_bytes` remain
    pub fn trim_to(&self, target_bytes: usize) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        while inner.total_bytes > target_bytes && inner.evict_oldest() {}
        before - inner.entries.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.lock().max_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Clone + Hash + Eq, V: Clone> Inner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let value = entry.value.clone();
        if let Some(owned) = self.recency.remove(&old_tick) {
            self.recency.insert(tick, owned);
        }
        Some(value)
    }

    fn insert(&mut self, key: K, value: V, byte_size: usize) {
        if let Some(old) = self.entries.remove(&key) {
            self.recency.remove(&old.tick);
            self.total_bytes = self.total_bytes.saturating_sub(old.byte_size);
        }
        if byte_size > self.max_bytes {
            return;
        }

        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                byte_size,
                tick,
            },
        );
        self.total_bytes = self.total_bytes.saturating_add(byte_size);

        while self.total_bytes > self.max_bytes && self.evict_oldest() {}
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.byte_size);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PreviewKey;

    fn key(hash: &str) -> PreviewKey {
        PreviewKey::new(hash, 300)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = LruCache::new(100);
        cache.insert(key("aa"), b"jpeg".to_vec(), 4);

        assert_eq!(cache.get(&key("aa")), Some(b"jpeg".to_vec()));
        assert_eq!(cache.get(&PreviewKey::new("aa", 1024)), None);
        assert_eq!((cache.len(), cache.total_bytes()), (1, 4));
    }

    #[test]
    fn test_read_refreshes_recency() {
        let cache = LruCache::new(30);
        for hash in ["a", "b", "c"] {
            cache.insert(key(hash), vec![0; 10], 10);
        }

        // "a" was read, so "b" is now the oldest
        cache.get(&key("a"));
        cache.insert(key("d"), vec![0; 10], 10);

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
        assert_eq!(cache.total_bytes(), 30);
    }

    #[test]
    fn test_reinsert_replaces_size() {
        let cache = LruCache::new(50);
        cache.insert(key("a"), vec![1], 10);
        cache.insert(key("a"), vec![2], 40);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 40);
        assert_eq!(cache.get(&key("a")), Some(vec![2]));
    }

    #[test]
    fn test_value_over_budget_is_skipped() {
        let cache = LruCache::new(10);
        cache.insert(key("fits"), vec![1], 5);
        cache.insert(key("too-big"), vec![2], 11);

        assert!(!cache.contains(&key("too-big")));
        assert!(cache.contains(&key("fits")));
    }

    #[test]
    fn test_trim_to_evicts_oldest_first() {
        let cache = LruCache::new(100);
        for i in 0..10 {
            cache.insert(key(&format!("h{}", i)), vec![i as u8], 10);
        }

        assert_eq!(cache.trim_to(50), 5);
        assert_eq!(cache.total_bytes(), 50);
        assert!(!cache.contains(&key("h0")));
        assert!(cache.contains(&key("h9")));

        assert_eq!(cache.trim_to(0), 5);
        assert!(cache.is_empty());
    }
}
