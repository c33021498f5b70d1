//! LRU Map Module
//!
//! Bounded map with least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};

// == LRU Map ==
/// Capacity-bounded map that evicts the least recently used key on insert.
///
/// Recency is a monotonically increasing tick per access:
/// - `entries` maps key -> (value, tick)
/// - `order` maps tick -> key, so the smallest tick is the eviction victim
#[derive(Debug)]
pub struct LruMap<V> {
    entries: HashMap<String, (V, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
    capacity: usize,
}

impl<V> LruMap<V> {
    // == Constructor ==
    /// Creates an empty map holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity: capacity.max(1),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    // == Insert ==
    /// Inserts or replaces a value, marking it most recently used.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: String, value: V) -> Option<String> {
        let tick = self.next_tick();
        if let Some((_, old_tick)) = self.entries.remove(&key) {
            self.order.remove(&old_tick);
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.order.insert(tick, key.clone());
        self.entries.insert(key, (value, tick));
        evicted
    }

    // == Touch ==
    /// Marks a key as recently used. Returns false if the key is unknown.
    pub fn touch(&mut self, key: &str) -> bool {
        let tick = self.next_tick();
        match self.entries.get_mut(key) {
            Some((_, slot_tick)) => {
                self.order.remove(&*slot_tick);
                *slot_tick = tick;
                self.order.insert(tick, key.to_string());
                true
            }
            None => false,
        }
    }

    // == Peek ==
    /// Returns a value without changing its recency.
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|(value, _)| value)
    }

    // == Evict Oldest ==
    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    // == Iterate ==
    /// Iterates over entries, most recently used first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> + '_ {
        self.order.values().rev().filter_map(move |key| {
            self.entries
                .get(key)
                .map(|(value, _)| (key.as_str(), value))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
