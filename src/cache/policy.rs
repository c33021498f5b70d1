//! Cache Policy Module
//!
//! Decides, per request, how long a cached result stays valid. `None` means
//! "never cache": the read is skipped and nothing is written. A zero period
//! still caches, but only matches entries from the current second.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::KeyArg;
use crate::config::Config;

/// Period used for methods without a rule.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

// == Period Request ==
/// What a period rule gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct PeriodRequest<'a> {
    pub method: &'a str,
    pub args: &'a [KeyArg],
    /// Explicit target instant, e.g. the start of a collection window
    pub when: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl PeriodRequest<'_> {
    /// The instant the request is about: `when` if given, otherwise the
    /// first instant found in the arguments.
    pub fn target(&self) -> Option<DateTime<Utc>> {
        self.when
            .or_else(|| self.args.iter().find_map(KeyArg::first_instant))
    }
}

pub type PeriodFn = dyn Fn(&PeriodRequest<'_>) -> Option<Duration> + Send + Sync;

// == Period Rule ==
#[derive(Clone)]
pub enum PeriodRule {
    Fixed(Duration),
    Never,
    Dynamic(Arc<PeriodFn>),
}

impl PeriodRule {
    /// Wraps a closure computing the period per request.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&PeriodRequest<'_>) -> Option<Duration> + Send + Sync + 'static,
    {
        PeriodRule::Dynamic(Arc::new(f))
    }

    fn resolve(&self, req: &PeriodRequest<'_>) -> Option<Duration> {
        match self {
            PeriodRule::Fixed(period) => Some(*period),
            PeriodRule::Never => None,
            PeriodRule::Dynamic(f) => f(req),
        }
    }
}

impl fmt::Debug for PeriodRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodRule::Fixed(period) => f.debug_tuple("Fixed").field(period).finish(),
            PeriodRule::Never => f.write_str("Never"),
            PeriodRule::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

// == Dynamic Period ==
/// Period growing with the distance to the request's target instant:
/// `multiplier * max(base, sqrt(seconds until target))`.
///
/// Targets in the past, or requests without a target, get `fallback`.
pub fn dynamic_period(multiplier: f64, base: Duration, fallback: Duration) -> PeriodRule {
    PeriodRule::dynamic(move |req| {
        let Some(target) = req.target() else {
            return Some(fallback);
        };
        let secs_until = (target - req.now).num_milliseconds() as f64 / 1000.0;
        if secs_until < 0.0 {
            return Some(fallback);
        }
        let secs = multiplier * base.as_secs_f64().max(secs_until.sqrt());
        Some(Duration::try_from_secs_f64(secs).unwrap_or(fallback))
    })
}

/// `dynamic_period` with multiplier 1.5, base 10s and fallback 60s.
pub fn default_dynamic_period() -> PeriodRule {
    dynamic_period(1.5, Duration::from_secs(10), Duration::from_secs(60))
}

// == Cache Policy ==
/// Per-method period table plus a default for unlisted methods.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    default_period: Duration,
    rules: HashMap<String, PeriodRule>,
}

impl CachePolicy {
    // == Constructor ==
    pub fn new(default_period: Duration) -> Self {
        Self {
            default_period,
            rules: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.default_period)
    }

    /// Sets a fixed period for `method`.
    pub fn with_period(self, method: impl Into<String>, period: Duration) -> Self {
        self.with_rule(method, PeriodRule::Fixed(period))
    }

    /// Disables caching for `method`.
    pub fn never_cache(self, method: impl Into<String>) -> Self {
        self.with_rule(method, PeriodRule::Never)
    }

    pub fn with_rule(mut self, method: impl Into<String>, rule: PeriodRule) -> Self {
        self.rules.insert(method.into(), rule);
        self
    }

    pub fn default_period(&self) -> Duration {
        self.default_period
    }

    // == Period For ==
    /// Period for this request, or `None` if it must not be cached.
    pub fn period_for(&self, req: &PeriodRequest<'_>) -> Option<Duration> {
        match self.rules.get(req.method) {
            Some(rule) => rule.resolve(req),
            None => Some(self.default_period),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}
