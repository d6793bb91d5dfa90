//! Weighted LRU (Least Recently Used) map
//!
//! Uses an intrusive linked list over a slab for O(1) reordering. Capacity
//! is a total weight rather than an item count; every entry weighs at least 1.

use std::collections::HashMap;
use std::hash::Hash;
use ahash::RandomState;

/// Node in the LRU doubly-linked list
struct Node<K, V> {
    key: K,
    value: V,
    weight: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU map bounded by the total weight of its entries
pub struct LruCache<K, V> {
    map: HashMap<K, usize, RandomState>,
    nodes: Vec<Option<Node<K, V>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    weight: usize,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new LRU map holding at most `capacity` total weight
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than 0");

        Self {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            weight: 0,
            capacity,
        }
    }

    /// Get a value and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some(&idx) = self.map.get(key) {
            self.move_to_front(idx);
            self.nodes[idx].as_ref().map(|node| &node.value)
        } else {
            None
        }
    }

    /// Check for a key without touching the LRU order
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert a key-value pair as most recently used
    ///
    /// # Returns
    /// * Every value that left the map: a replaced value for the same key
    ///   and the least recently used entries evicted to fit the bound. If
    ///   `weight` alone exceeds the capacity, the new entry is among them.
    pub fn put(&mut self, key: K, value: V, weight: usize) -> Vec<(K, V)> {
        let weight = weight.max(1);
        let mut removed = Vec::new();

        if let Some(&idx) = self.map.get(&key) {
            // Update existing
            if let Some(node) = &mut self.nodes[idx] {
                let old = std::mem::replace(&mut node.value, value);
                self.weight = self.weight - node.weight + weight;
                node.weight = weight;
                removed.push((key, old));
            }
            self.move_to_front(idx);
        } else {
            // Insert new
            let idx = self.alloc_node();
            self.nodes[idx] = Some(Node {
                key: key.clone(),
                value,
                weight,
                prev: None,
                next: None,
            });
            self.link_front(idx);
            self.map.insert(key, idx);
            self.weight += weight;
        }

        while self.weight > self.capacity {
            match self.evict() {
                Some(entry) => removed.push(entry),
                None => break,
            }
        }
        removed
    }

    /// Remove a key from the map
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(idx) = self.map.remove(key) {
            self.unlink(idx);
            self.free_node(idx);
            self.nodes[idx].take().map(|node| {
                self.weight -= node.weight;
                node.value
            })
        } else {
            None
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total weight of all entries
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// Maximum total weight
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match &self.nodes[idx] {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let entries = self
            .nodes
            .drain(..)
            .flatten()
            .map(|node| (node.key, node.value))
            .collect();
        self.map.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        self.weight = 0;
        entries
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.link_front(idx);
        }
    }

    /// Link a detached node in as the head
    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|head| self.nodes[head].as_mut()) {
            Some(head) => head.prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.nodes[idx].as_ref().map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev.and_then(|p| self.nodes[p].as_mut()) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.nodes[n].as_mut()) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
    }

    fn evict(&mut self) -> Option<(K, V)> {
        let tail_idx = self.tail?;
        self.unlink(tail_idx);
        let node = self.nodes[tail_idx].take()?;
        self.map.remove(&node.key);
        self.free_node(tail_idx);
        self.weight -= node.weight;
        Some((node.key, node.value))
    }

    fn alloc_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.free_list.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_basic() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a", 1);
        cache.put(2, "b", 1);

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a", 1);
        cache.put(2, "b", 1);
        let evicted = cache.put(3, "c", 1); // Should evict 1

        assert_eq!(evicted, vec![(1, "a")]);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn test_lru_update() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a", 1);
        cache.put(2, "b", 1);
        cache.get(&1); // Move 1 to front
        cache.put(3, "c", 1); // Should evict 2

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn test_weighted_eviction() {
        let mut cache = LruCache::new(10);

        cache.put("a", 1, 4);
        cache.put("b", 2, 4);
        let evicted = cache.put("c", 3, 6);

        assert_eq!(evicted, vec![("a", 1), ("b", 2)]);
        assert_eq!(cache.weight(), 6);
        assert_eq!(cache.keys(), vec!["c"]);
    }

    #[test]
    fn test_oversized_entry_evicts_itself() {
        let mut cache = LruCache::new(4);

        cache.put("a", 1, 2);
        let evicted = cache.put("big", 2, 5);

        assert_eq!(evicted, vec![("a", 1), ("big", 2)]);
        assert!(cache.is_empty());
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn test_zero_weight_counts_as_one() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a", 0);
        cache.put(2, "b", 0);
        let evicted = cache.put(3, "c", 0);

        assert_eq!(cache.weight(), 2);
        assert_eq!(evicted, vec![(1, "a")]);
    }

    #[test]
    fn test_lru_remove() {
        let mut cache = LruCache::new(3);

        cache.put(1, "a", 1);
        cache.put(2, "b", 1);
        cache.put(3, "c", 1);

        assert_eq!(cache.remove(&2), Some("b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.weight(), 2);
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn test_lru_drain() {
        let mut cache = LruCache::new(3);

        cache.put(1, "a", 1);
        cache.put(2, "b", 1);
        let mut drained = cache.drain();
        drained.sort();

        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        cache.put(4, "d", 1);
        assert_eq!(cache.keys(), vec![4]);
    }

    #[test]
    fn test_lru_overwrite() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a", 1);
        let replaced = cache.put(1, "b", 1); // Overwrite

        assert_eq!(replaced, vec![(1, "a")]);
        assert_eq!(cache.get(&1), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }
}
