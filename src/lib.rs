//! Transit Cache - A caching layer for transit-query API clients
//!
//! Serves repeated point-in-time and time-window queries from SQLite, Redis
//! or a bounded in-memory LRU instead of the upstream API while still fresh.

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;
pub mod tasks;

pub use cache::{CacheEngine, Cached, CachePolicy, CallOptions, KeyArg, Location, Window};
pub use config::Config;
pub use error::{CacheError, Result, StoreError};
pub use storage::{MemoryStore, RedisStore, SqliteStore, Storage};
pub use tasks::{spawn_purge_task, spawn_stats_task};
