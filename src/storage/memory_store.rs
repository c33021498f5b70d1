//! In-Memory Store Module
//!
//! Bounded LRU store using the same key scheme as the Redis store. There is
//! no TTL: freshness is decided at read time from the creation timestamp
//! embedded in each key, and eviction only happens under capacity pressure.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::StoreResult;
use crate::storage::{
    new_id, window_covers, AtomRead, AtomWrite, CollectionRead, CollectionWrite, LruMap, Row, Storage,
    ATOMS, COLLECTIONS, DATA_VERSION,
};

/// Default number of entries kept before evicting.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

// == Slot ==
/// Value stored under one LRU key.
///
/// A collection keeps its rows next to its window metadata, so eviction
/// drops a collection as a whole and never leaves it partially readable.
#[derive(Debug, Clone)]
enum Slot {
    Atom(String),
    Collection {
        when: i64,
        duration: i64,
        rows: Vec<Row>,
    },
}

// == Memory Store Stats ==
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub entries: usize,
    pub capacity: usize,
    /// Entries dropped because the store was full
    pub evictions: u64,
}

#[derive(Debug)]
struct MemoryInner {
    entries: LruMap<Slot>,
    evictions: u64,
}

impl MemoryInner {
    fn insert(&mut self, key: String, slot: Slot) {
        if let Some(evicted) = self.entries.insert(key, slot) {
            debug!(key = %evicted, "evicted least recently used entry");
            self.evictions += 1;
        }
    }
}

// == Memory Store ==
/// In-process `Storage` backed by an `LruMap`.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    // == Constructor ==
    /// Creates a store holding at most `max_entries` atoms and collections.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: LruMap::new(max_entries),
                evictions: 0,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_entries)
    }

    // == Stats ==
    pub async fn stats(&self) -> MemoryStoreStats {
        let inner = self.inner.lock().await;
        MemoryStoreStats {
            entries: inner.entries.len(),
            capacity: inner.entries.capacity(),
            evictions: inner.evictions,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

fn key_prefix(family: &str, method: &str, key: &str) -> String {
    format!("{}:{}:{}:{}:", DATA_VERSION, family, method, key)
}

/// Parses the creation timestamp following `prefix`, if `entry_key` has it.
///
/// Collection keys carry the collection id after the timestamp.
fn created_after_prefix(entry_key: &str, prefix: &str) -> Option<i64> {
    let rest = entry_key.strip_prefix(prefix)?;
    rest.split(':').next()?.parse().ok()
}

#[async_trait]
impl Storage for MemoryStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn read_atom(&self, query: &AtomRead<'_>) -> StoreResult<Option<String>> {
        debug!(method = query.method, key = query.key, "memory: read atom");
        let prefix = key_prefix(ATOMS, query.method, query.key);
        let mut inner = self.inner.lock().await;

        let found = inner.entries.iter().find_map(|(entry_key, slot)| {
            let created = created_after_prefix(entry_key, &prefix)?;
            if created < query.created_min || created > query.created_max {
                return None;
            }
            match slot {
                Slot::Atom(value) => Some((entry_key.to_string(), value.clone())),
                Slot::Collection { .. } => None,
            }
        });

        Ok(found.map(|(entry_key, value)| {
            inner.entries.touch(&entry_key);
            value
        }))
    }

    async fn write_atom(&self, entry: &AtomWrite<'_>) -> StoreResult<()> {
        debug!(method = entry.method, key = entry.key, created = entry.created_at, "memory: write atom");
        let key = format!(
            "{}{}",
            key_prefix(ATOMS, entry.method, entry.key),
            entry.created_at
        );
        self.inner
            .lock()
            .await
            .insert(key, Slot::Atom(entry.value.to_string()));
        Ok(())
    }

    async fn read_collection(&self, query: &CollectionRead<'_>) -> StoreResult<Option<Vec<Row>>> {
        debug!(
            method = query.method,
            key = query.key,
            when_min = query.when_min,
            when_max = query.when_max,
            "memory: read collection"
        );
        let prefix = key_prefix(COLLECTIONS, query.method, query.key);
        let mut inner = self.inner.lock().await;

        let found = inner.entries.iter().find_map(|(entry_key, slot)| {
            let created = created_after_prefix(entry_key, &prefix)?;
            if created < query.created_min || created > query.created_max {
                return None;
            }
            match slot {
                Slot::Collection {
                    when,
                    duration,
                    rows,
                } if window_covers(*when, *duration, query.when_min, query.when_max) => {
                    let rows: Vec<Row> = rows
                        .iter()
                        .filter(|row| {
                            let t = row.when_secs();
                            t >= query.when_min && t <= query.when_max
                        })
                        .cloned()
                        .collect();
                    Some((entry_key.to_string(), rows))
                }
                _ => None,
            }
        });

        Ok(found.map(|(entry_key, rows)| {
            inner.entries.touch(&entry_key);
            rows
        }))
    }

    async fn write_collection(&self, entry: &CollectionWrite<'_>) -> StoreResult<()> {
        debug!(
            method = entry.method,
            key = entry.key,
            when = entry.when,
            duration = entry.duration,
            rows = entry.rows.len(),
            "memory: write collection"
        );
        // one slot per window, even within the same second
        let key = format!(
            "{}{}:{}",
            key_prefix(COLLECTIONS, entry.method, entry.key),
            entry.created_at,
            new_id()
        );
        let mut rows = entry.rows.to_vec();
        crate::storage::sort_rows(&mut rows);

        self.inner.lock().await.insert(
            key,
            Slot::Collection {
                when: entry.when,
                duration: entry.duration,
                rows,
            },
        );
        Ok(())
    }
}
