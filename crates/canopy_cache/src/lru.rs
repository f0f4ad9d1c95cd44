//! Byte-bounded least-recently-used eviction cache.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Hit, miss and eviction counters of an [`EvictionCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries dropped to make room for others.
    pub evictions: u64,
}

/// A node in the recency list.
#[derive(Debug)]
struct Node<V> {
    key: String,
    value: V,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Slab-backed recency list plus key index. Head is least recently used.
#[derive(Debug)]
struct Lru<V> {
    capacity: usize,
    memory: usize,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<String, usize>,
    stats: CacheStats,
}

impl<V> Lru<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            memory: 0,
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self
            .slots
            .get(idx)
            .and_then(Option::as_ref)
            .map(|n| (n.prev, n.next))
        else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.node_mut(idx) {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(node) = self.node_mut(t) {
                    node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn remove_at(&mut self, idx: usize) -> Option<Node<V>> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.index.remove(&node.key);
        self.memory -= node.size;
        Some(node)
    }

    fn insert(&mut self, key: String, value: V, size: usize) {
        let node = Node {
            key: key.clone(),
            value,
            size,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_back(idx);
        self.index.insert(key, idx);
        self.memory += size;
    }

    fn set(&mut self, key: String, value: V, size: usize) {
        if let Some(idx) = self.index.get(&key).copied() {
            self.remove_at(idx);
        }
        if size > self.capacity {
            return;
        }
        while self.memory + size > self.capacity {
            let Some(oldest) = self.head else {
                break;
            };
            self.remove_at(oldest);
            self.stats.evictions += 1;
        }
        self.insert(key, value, size);
    }

    fn touch(&mut self, key: &str) -> Option<usize> {
        let Some(idx) = self.index.get(key).copied() else {
            self.stats.misses += 1;
            return None;
        };
        self.stats.hits += 1;
        if self.tail != Some(idx) {
            self.unlink(idx);
            self.push_back(idx);
        }
        Some(idx)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.memory = 0;
    }
}

/// A thread-safe LRU cache bounded by the total size of its entries.
///
/// Every entry carries a caller-supplied size. Inserting an entry evicts
/// least-recently-used entries one at a time until the new entry fits. An
/// entry larger than the whole capacity is rejected; if its key was already
/// present, the old entry is dropped so no stale value survives the write.
///
/// All operations are O(1) amortized and serialized by an internal mutex,
/// so recency bookkeeping stays consistent under concurrent use.
///
/// # Example
///
/// ```
/// use canopy_cache::EvictionCache;
///
/// let cache = EvictionCache::new(2);
/// cache.set("a", 1, 1);
/// cache.set("b", 2, 1);
/// cache.get("a");
/// cache.set("c", 3, 1); // evicts "b"
/// assert!(cache.contains("a"));
/// assert!(!cache.contains("b"));
/// ```
#[derive(Debug)]
pub struct EvictionCache<V> {
    inner: Mutex<Lru<V>>,
}

impl<V: Clone> EvictionCache<V> {
    /// Creates a cache holding at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(capacity)),
        }
    }

    /// Inserts or replaces an entry.
    pub fn set(&self, key: impl Into<String>, value: V, size: usize) {
        self.inner.lock().set(key.into(), value, size);
    }

    /// Returns the entry and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut lru = self.inner.lock();
        let idx = lru.touch(key)?;
        lru.slots
            .get(idx)
            .and_then(Option::as_ref)
            .map(|node| node.value.clone())
    }

    /// Removes an entry. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut lru = self.inner.lock();
        match lru.index.get(key).copied() {
            Some(idx) => lru.remove_at(idx).is_some(),
            None => false,
        }
    }

    /// Removes every entry. Statistics are kept.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Returns true if the key is present, without touching recency or stats.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    /// Keys from least to most recently used, without touching stats.
    pub fn keys(&self) -> Vec<String> {
        let lru = self.inner.lock();
        let mut keys = Vec::with_capacity(lru.index.len());
        let mut cursor = lru.head;
        while let Some(idx) = cursor {
            let Some(node) = lru.slots.get(idx).and_then(Option::as_ref) else {
                break;
            };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of all entries.
    pub fn get_memory(&self) -> usize {
        self.inner.lock().memory
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Hit, miss and eviction counters.
    pub fn get_stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lru_capacity_scenario() {
        let cache = EvictionCache::new(19);
        for i in 0..20 {
            cache.set(i.to_string(), i, 1);
        }
        assert!(!cache.contains("0"));
        assert_eq!(cache.len(), 19);
        assert_eq!(cache.get_memory(), 19);

        cache.set("a", 100, 1);
        assert!(!cache.contains("1"));

        assert_eq!(cache.get("2"), Some(2));
        cache.set("b", 200, 1);
        assert!(!cache.contains("3"));
        assert!(cache.contains("2"));

        cache.set("b", 201, 10);
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.get_memory(), 19);
        assert!(cache.contains("2"));
        for evicted in 4..=12 {
            assert!(!cache.contains(&evicted.to_string()));
        }

        assert!(cache.delete("b"));
        assert_eq!(cache.get_memory(), 9);
        assert_eq!(cache.len(), 9);

        assert_eq!(
            cache.get_stats(),
            CacheStats {
                hits: 1,
                misses: 0,
                evictions: 12
            }
        );
    }

    #[test]
    fn lru_rejects_entry_larger_than_capacity() {
        let cache = EvictionCache::new(1);
        cache.set("a", "v", 100);
        assert!(!cache.contains("a"));
        assert_eq!(cache.get_memory(), 0);
        assert_eq!(cache.get_stats().evictions, 0);
    }

    #[test]
    fn lru_oversized_replacement_drops_stale_value() {
        let cache = EvictionCache::new(4);
        cache.set("a", "old", 1);
        cache.set("a", "new", 10);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get_memory(), 0);
    }

    #[test]
    fn lru_counts_hits_and_misses() {
        let cache = EvictionCache::new(10);
        assert!(cache.get("a").is_none());
        cache.set("a", 1, 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(
            cache.get_stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn lru_clear_resets_memory() {
        let cache = EvictionCache::new(10);
        cache.set("a", 1, 3);
        cache.set("b", 2, 4);
        cache.clear();
        assert_eq!(cache.get_memory(), 0);
        assert!(cache.is_empty());
        cache.set("c", 3, 10);
        assert!(cache.contains("c"));
    }

    #[test]
    fn lru_keys_and_contains_do_not_count() {
        let cache = EvictionCache::new(10);
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        assert!(cache.contains("a"));
        assert_eq!(cache.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.get_stats(), CacheStats::default());
    }

    #[test]
    fn lru_get_moves_to_most_recent() {
        let cache = EvictionCache::new(3);
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        cache.set("c", 3, 1);
        cache.get("a");
        assert_eq!(cache.keys(), vec!["b", "c", "a"]);
        cache.set("d", 4, 1);
        assert_eq!(cache.keys(), vec!["c", "a", "d"]);
    }

    #[test]
    fn lru_delete_missing_is_noop() {
        let cache: EvictionCache<i32> = EvictionCache::new(3);
        assert!(!cache.delete("missing"));
    }

    proptest! {
        #[test]
        fn lru_memory_never_exceeds_capacity(
            ops in prop::collection::vec((0u8..16, 0usize..12, any::<bool>()), 1..200),
        ) {
            let cache = EvictionCache::new(32);
            for (key, size, is_get) in ops {
                let key = key.to_string();
                if is_get {
                    cache.get(&key);
                } else {
                    cache.set(key, size, size);
                }
                prop_assert!(cache.get_memory() <= 32);
                prop_assert_eq!(cache.keys().len(), cache.len());
            }
        }

        #[test]
        fn lru_memory_is_sum_of_entry_sizes(
            sizes in prop::collection::vec(1usize..8, 1..50),
        ) {
            let cache = EvictionCache::new(24);
            for (i, size) in sizes.iter().enumerate() {
                cache.set(i.to_string(), *size, *size);
            }
            let total: usize = cache
                .keys()
                .iter()
                .map(|k| cache.get(k).unwrap_or_default())
                .sum();
            prop_assert_eq!(total, cache.get_memory());
        }
    }
}
