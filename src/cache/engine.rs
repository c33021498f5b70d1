//! Cache Engine Module
//!
//! Wraps upstream calls in two modes:
//! - atomic: a result is cached and served as a whole
//! - collection: a result is cached as timestamped rows of a time window,
//!   so any narrower window inside it can be served from the same fetch
//!
//! Storage is an accelerator only. Transient storage faults turn into misses
//! (reads) or no-ops (writes); contract violations and upstream errors reach
//! the caller. Concurrent identical misses are not de-duplicated.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, warn};

use crate::cache::{derive_key, CacheEvent, CachePolicy, KeyArg, PeriodRequest};
use crate::error::{CacheError, Result, StoreError};
use crate::storage::{
    ceil_secs, floor_secs, AtomRead, AtomWrite, CollectionRead, CollectionWrite, Row, Storage,
};

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

// == Cached ==
/// A value returned from a cached call, with how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    /// True if served from storage without calling upstream
    pub cached: bool,
    /// Wall time spent in the call
    pub elapsed: Duration,
}

impl<T> Cached<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Cached<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

// == Call Options ==
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Skip the read and always call upstream; the result is still stored
    pub bypass: bool,
    /// Target instant for dynamic periods, if not among the key arguments
    pub when: Option<DateTime<Utc>>,
}

impl CallOptions {
    pub fn bypass() -> Self {
        Self {
            bypass: true,
            ..Self::default()
        }
    }
}

// == Window ==
/// Time window requested from a collection method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

impl Window {
    pub fn new(start: DateTime<Utc>, duration: Duration) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.start.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Window bounds in whole seconds, widened outwards.
    fn bounds(&self) -> (i64, i64) {
        (floor_secs(&self.start), ceil_secs(&self.end()))
    }
}

// == Timestamped ==
/// Items of a collection method, each belonging to one instant.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

// == Freshness ==
/// Creation-time bounds of entries still valid at `now`.
#[derive(Debug, Clone, Copy)]
struct Freshness {
    created_at: i64,
    created_min: i64,
    created_max: i64,
    period: Duration,
}

impl Freshness {
    fn new(now: &DateTime<Utc>, period: Duration) -> Self {
        // now rounded to the nearest second
        let now_ms = now.timestamp_millis();
        let now_s = (now_ms + 500).div_euclid(1000);
        let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);
        let created_min = now_s.saturating_mul(1000).saturating_sub(period_ms).div_euclid(1000);
        Self {
            created_at: now_s,
            created_min,
            created_max: now_s,
            period,
        }
    }
}

// == Cache Engine ==
/// Caching front for an upstream client.
///
/// Cheap to share behind an `Arc`; storage is owned by the caller.
pub struct CacheEngine {
    storage: Arc<dyn Storage>,
    policy: CachePolicy,
    events: broadcast::Sender<CacheEvent>,
    initialized: OnceCell<()>,
}

impl CacheEngine {
    // == Constructor ==
    pub fn new(storage: Arc<dyn Storage>, policy: CachePolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage,
            policy,
            events,
            initialized: OnceCell::new(),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Subscribes to hit/miss events of calls made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    // == Init ==
    /// Runs storage setup once. Later calls return immediately.
    ///
    /// A failed setup is retried on the next call.
    pub async fn init(&self) -> std::result::Result<(), StoreError> {
        self.initialized
            .get_or_try_init(|| self.storage.init())
            .await
            .map(|_| ())
    }

    /// Initializes storage, returning false if it is unusable right now.
    async fn storage_ready(&self) -> Result<bool> {
        match self.init().await {
            Ok(()) => Ok(true),
            Err(e) => self.absorb(e, "init").map(|()| false),
        }
    }

    /// Swallows transient storage faults, propagates contract violations.
    fn absorb(&self, err: StoreError, op: &str) -> Result<()> {
        if err.is_contract_violation() {
            return Err(CacheError::Storage(err));
        }
        warn!(op, error = %err, "storage fault ignored");
        Ok(())
    }

    fn emit(&self, event: CacheEvent) {
        debug!(method = %event.method, kind = ?event.kind, size = ?event.size, "cache event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn freshness(
        &self,
        method: &str,
        args: &[KeyArg],
        when: Option<DateTime<Utc>>,
    ) -> Option<Freshness> {
        let now = Utc::now();
        let period = self.policy.period_for(&PeriodRequest {
            method,
            args,
            when,
            now,
        })?;
        Some(Freshness::new(&now, period))
    }

    // == Atomic ==
    /// Cached call whose result is stored and served as a whole.
    pub async fn atomic<T, F, Fut, E>(&self, method: &str, args: &[KeyArg], fetch: F) -> Result<Cached<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.atomic_with(method, args, CallOptions::default(), fetch)
            .await
    }

    pub async fn atomic_with<T, F, Fut, E>(
        &self,
        method: &str,
        args: &[KeyArg],
        opts: CallOptions,
        fetch: F,
    ) -> Result<Cached<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let started = Instant::now();
        let key = derive_key(method, args)?;
        let fresh = self.freshness(method, args, opts.when);

        if let Some(fresh) = fresh.filter(|_| !opts.bypass) {
            if self.storage_ready().await? {
                let read = self
                    .storage
                    .read_atom(&AtomRead {
                        method,
                        key: key.as_str(),
                        created_min: fresh.created_min,
                        created_max: fresh.created_max,
                    })
                    .await;

                match read.and_then(|raw| raw.map(|raw| decode::<T>(&raw)).transpose()) {
                    Ok(Some(value)) => {
                        self.emit(CacheEvent::hit(method, args, None));
                        return Ok(Cached {
                            value,
                            cached: true,
                            elapsed: started.elapsed(),
                        });
                    }
                    Ok(None) => {}
                    Err(e) => self.absorb(e, "read_atom")?,
                }
            }
        }

        self.emit(CacheEvent::miss(method, args));
        let value = fetch().await.map_err(|e| CacheError::Upstream(e.into()))?;

        if let Some(fresh) = fresh {
            let raw = serde_json::to_string(&value)?;
            if self.storage_ready().await? {
                let written = self
                    .storage
                    .write_atom(&AtomWrite {
                        method,
                        key: key.as_str(),
                        created_at: fresh.created_at,
                        ttl: fresh.period,
                        value: &raw,
                    })
                    .await;
                if let Err(e) = written {
                    self.absorb(e, "write_atom")?;
                }
            }
        }

        Ok(Cached {
            value,
            cached: false,
            elapsed: started.elapsed(),
        })
    }

    // == Collection ==
    /// Cached call over a time window, stored as timestamped rows.
    ///
    /// `to_rows` turns a fetched result into rows; `from_rows` rebuilds a
    /// result from the rows of the requested window. A covering window with
    /// no rows in range counts as a miss.
    pub async fn collection<T, F, Fut, E, TR, FR>(
        &self,
        method: &str,
        args: &[KeyArg],
        window: Window,
        fetch: F,
        to_rows: TR,
        from_rows: FR,
    ) -> Result<Cached<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
        TR: FnOnce(&T) -> Result<Vec<Row>>,
        FR: FnOnce(Vec<Row>) -> Result<T>,
    {
        self.collection_with(
            method,
            args,
            window,
            CallOptions::default(),
            fetch,
            to_rows,
            from_rows,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn collection_with<T, F, Fut, E, TR, FR>(
        &self,
        method: &str,
        args: &[KeyArg],
        window: Window,
        opts: CallOptions,
        fetch: F,
        to_rows: TR,
        from_rows: FR,
    ) -> Result<Cached<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
        TR: FnOnce(&T) -> Result<Vec<Row>>,
        FR: FnOnce(Vec<Row>) -> Result<T>,
    {
        let started = Instant::now();
        let key = derive_key(method, args)?;
        let fresh = self.freshness(method, args, opts.when.or(Some(window.start)));
        let (when_min, when_max) = window.bounds();

        if let Some(fresh) = fresh.filter(|_| !opts.bypass) {
            if self.storage_ready().await? {
                let read = self
                    .storage
                    .read_collection(&CollectionRead {
                        method,
                        key: key.as_str(),
                        when_min,
                        when_max,
                        created_min: fresh.created_min,
                        created_max: fresh.created_max,
                    })
                    .await;

                match read {
                    Ok(Some(rows)) if !rows.is_empty() => {
                        let size = rows.len();
                        match from_rows(rows) {
                            Ok(value) => {
                                self.emit(CacheEvent::hit(method, args, Some(size)));
                                return Ok(Cached {
                                    value,
                                    cached: true,
                                    elapsed: started.elapsed(),
                                });
                            }
                            Err(CacheError::Storage(e)) => self.absorb(e, "read_collection")?,
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => self.absorb(e, "read_collection")?,
                }
            }
        }

        self.emit(CacheEvent::miss(method, args));
        let value = fetch().await.map_err(|e| CacheError::Upstream(e.into()))?;

        if let Some(fresh) = fresh {
            let rows = to_rows(&value)?;
            if self.storage_ready().await? {
                let written = self
                    .storage
                    .write_collection(&CollectionWrite {
                        method,
                        key: key.as_str(),
                        when: when_min,
                        duration: when_max - when_min,
                        created_at: fresh.created_at,
                        ttl: fresh.period,
                        rows: &rows,
                    })
                    .await;
                if let Err(e) = written {
                    self.absorb(e, "write_collection")?;
                }
            }
        }

        Ok(Cached {
            value,
            cached: false,
            elapsed: started.elapsed(),
        })
    }

    // == Collection Items ==
    /// `collection` for a list of `Timestamped` items, one row per item.
    pub async fn collection_items<I, F, Fut, E>(
        &self,
        method: &str,
        args: &[KeyArg],
        window: Window,
        opts: CallOptions,
        fetch: F,
    ) -> Result<Cached<Vec<I>>>
    where
        I: Timestamped + Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<I>, E>>,
        E: Into<anyhow::Error>,
    {
        self.collection_with(
            method,
            args,
            window,
            opts,
            fetch,
            items_to_rows::<I>,
            items_from_rows::<I>,
        )
        .await
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> std::result::Result<T, StoreError> {
    serde_json::from_str(raw).map_err(StoreError::from)
}

#[allow(clippy::ptr_arg)]
fn items_to_rows<I: Timestamped + Serialize>(items: &Vec<I>) -> Result<Vec<Row>> {
    items
        .iter()
        .map(|item| Ok(Row::new(item.timestamp(), serde_json::to_string(item)?)))
        .collect()
}

fn items_from_rows<I: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<I>> {
    rows.iter()
        .map(|row| decode(&row.data).map_err(CacheError::Storage))
        .collect()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_freshness_rounds_now_to_nearest_second() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_600).unwrap();
        let fresh = Freshness::new(&now, Duration::from_secs(60));
        assert_eq!(fresh.created_at, 1_700_000_001);
        assert_eq!(fresh.created_max, 1_700_000_001);
        assert_eq!(fresh.created_min, 1_699_999_941);
    }

    #[test]
    fn test_freshness_sub_second_period_rounds_down() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let fresh = Freshness::new(&now, Duration::from_millis(1500));
        assert_eq!(fresh.created_min, 1_699_999_998);
    }

    #[test]
    fn test_window_bounds_widen_outwards() {
        let start = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        let window = Window::new(start, Duration::from_millis(600_500));
        assert_eq!(window.bounds(), (1_700_000_000, 1_700_000_601));
    }

    #[test]
    fn test_cached_derefs_to_value() {
        let c = Cached {
            value: vec![1, 2, 3],
            cached: true,
            elapsed: Duration::from_millis(2),
        };
        assert_eq!(c.len(), 3);
        assert_eq!(c.into_inner(), vec![1, 2, 3]);
    }
}
