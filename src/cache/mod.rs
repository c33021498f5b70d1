//! Cache Module
//!
//! Key derivation, period policy, hit/miss events and the engine tying them
//! to a `Storage` backend.

mod engine;
mod key;
mod policy;
mod stats;


// Re-export public types
pub use engine::{CacheEngine, Cached, CallOptions, Timestamped, Window};
pub use key::{canonicalize, derive_key, CacheKey, KeyArg, Location, KEY_LENGTH};
pub use policy::{
    default_dynamic_period, dynamic_period, CachePolicy, PeriodFn, PeriodRequest, PeriodRule,
    DEFAULT_PERIOD,
};
pub use stats::{CacheEvent, CacheStats, EventKind, MethodStats};
