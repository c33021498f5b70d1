//! Storage Module
//!
//! The contract every cache backend implements, plus the three adapters:
//! SQLite (relational), Redis (key-scan) and a bounded in-memory LRU.
//!
//! All timestamps crossing this boundary are Unix seconds. The engine does
//! the bucketing, so adapters compare integers and never round on their own.

mod lru;
mod memory_store;
mod redis_store;
mod sqlite_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;

use crate::error::StoreResult;

pub use self::lru::LruMap;
pub use self::memory_store::{MemoryStore, MemoryStoreStats};
pub use self::redis_store::RedisStore;
pub use self::sqlite_store::SqliteStore;

// == Public Constants ==
/// Version tag mixed into every key and table name.
pub const DATA_VERSION: &str = "1";

/// Key family for atom entries
pub(crate) const ATOMS: &str = "a";
/// Key family for collection metadata
pub(crate) const COLLECTIONS: &str = "c";
/// Key family for collection rows
pub(crate) const COLLECTION_ROWS: &str = "r";

// == Row ==
/// One cached item of a collection, with the instant it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub when: DateTime<Utc>,
    /// Serialized item
    pub data: String,
}

impl Row {
    pub fn new(when: DateTime<Utc>, data: impl Into<String>) -> Self {
        Self {
            when,
            data: data.into(),
        }
    }

    /// Row timestamp in whole seconds, rounded down.
    pub fn when_secs(&self) -> i64 {
        floor_secs(&self.when)
    }

    pub(crate) fn from_secs(when: i64, data: String) -> Self {
        Self {
            when: from_unix_secs(when),
            data,
        }
    }
}

// == Requests ==
/// Lookup of an atom created within `[created_min, created_max]`.
#[derive(Debug, Clone, Copy)]
pub struct AtomRead<'a> {
    pub method: &'a str,
    pub key: &'a str,
    pub created_min: i64,
    pub created_max: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomWrite<'a> {
    pub method: &'a str,
    pub key: &'a str,
    pub created_at: i64,
    /// Cache period, usable as a native TTL
    pub ttl: Duration,
    pub value: &'a str,
}

/// Lookup of rows in `[when_min, when_max]` from a stored window covering it.
#[derive(Debug, Clone, Copy)]
pub struct CollectionRead<'a> {
    pub method: &'a str,
    pub key: &'a str,
    pub when_min: i64,
    pub when_max: i64,
    pub created_min: i64,
    pub created_max: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectionWrite<'a> {
    pub method: &'a str,
    pub key: &'a str,
    /// Window start
    pub when: i64,
    /// Window length in seconds
    pub duration: i64,
    pub created_at: i64,
    pub ttl: Duration,
    pub rows: &'a [Row],
}

// == Storage Trait ==
/// Backend contract used by the cache engine.
///
/// A normal miss is `Ok(None)`, never an error. Implementations are shared
/// across tasks and must tolerate concurrent calls against the same key.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent setup. The engine awaits it once before the first read.
    async fn init(&self) -> StoreResult<()>;

    async fn read_atom(&self, query: &AtomRead<'_>) -> StoreResult<Option<String>>;

    async fn write_atom(&self, entry: &AtomWrite<'_>) -> StoreResult<()>;

    /// Rows ordered by timestamp, or `None` if no covering window exists.
    async fn read_collection(&self, query: &CollectionRead<'_>) -> StoreResult<Option<Vec<Row>>>;

    async fn write_collection(&self, entry: &CollectionWrite<'_>) -> StoreResult<()>;
}

// == Utility Functions ==
/// Covering predicate shared by all backends.
pub fn window_covers(when: i64, duration: i64, when_min: i64, when_max: i64) -> bool {
    when <= when_min && when + duration >= when_max
}

/// Returns a random 20-character hex id.
pub(crate) fn new_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn floor_secs(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis().div_euclid(1000)
}

pub(crate) fn ceil_secs(t: &DateTime<Utc>) -> i64 {
    let ms = t.timestamp_millis();
    ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) != 0)
}

pub(crate) fn from_unix_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Orders rows by timestamp, keeping insertion order for equal instants.
pub(crate) fn sort_rows(rows: &mut [Row]) {
    rows.sort_by_key(Row::when_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_covers() {
        assert!(window_covers(100, 600, 100, 700));
        assert!(window_covers(100, 600, 280, 460));
        assert!(!window_covers(100, 300, 100, 700));
        assert!(!window_covers(100, 600, 99, 200));
    }

    #[test]
    fn test_second_rounding() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_400).unwrap();
        assert_eq!(floor_secs(&t), 1_700_000_000);
        assert_eq!(ceil_secs(&t), 1_700_000_001);

        let exact = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(ceil_secs(&exact), 1_700_000_000);
    }

    #[test]
    fn test_new_id_shape() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_sort_rows_is_stable() {
        let mut rows = vec![
            Row::from_secs(20, "b".into()),
            Row::from_secs(10, "a".into()),
            Row::from_secs(20, "c".into()),
        ];
        sort_rows(&mut rows);
        let data: Vec<_> = rows.iter().map(|r| r.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b", "c"]);
    }
}
