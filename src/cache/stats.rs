//! Cache Statistics Module
//!
//! Hit/miss events emitted by the engine, and counters built from them.

use std::collections::HashMap;

use serde::Serialize;

use crate::cache::KeyArg;

// == Cache Event ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Hit,
    Miss,
}

/// One hit or miss, emitted exactly once per cached call.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub method: String,
    pub args: Vec<KeyArg>,
    /// Number of rows served, for collection hits
    pub size: Option<usize>,
}

impl CacheEvent {
    pub fn hit(method: &str, args: &[KeyArg], size: Option<usize>) -> Self {
        Self {
            kind: EventKind::Hit,
            method: method.to_string(),
            args: args.to_vec(),
            size,
        }
    }

    pub fn miss(method: &str, args: &[KeyArg]) -> Self {
        Self {
            kind: EventKind::Miss,
            method: method.to_string(),
            args: args.to_vec(),
            size: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.kind == EventKind::Hit
    }
}

// == Method Stats ==
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MethodStats {
    pub hits: u64,
    pub misses: u64,
}

// == Cache Stats ==
/// Hit/miss counters, overall and per method.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Calls served from storage
    pub hits: u64,
    /// Calls that went upstream
    pub misses: u64,
    pub methods: HashMap<String, MethodStats>,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if nothing was recorded.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Record ==
    pub fn record(&mut self, event: &CacheEvent) {
        let method = self.methods.entry(event.method.clone()).or_default();
        match event.kind {
            EventKind::Hit => {
                self.hits += 1;
                method.hits += 1;
            }
            EventKind::Miss => {
                self.misses += 1;
                method.misses += 1;
            }
        }
    }

    pub fn method(&self, method: &str) -> MethodStats {
        self.methods.get(method).copied().unwrap_or_default()
    }
}
