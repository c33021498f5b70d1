//! Integration Tests for the Cache Engine
//!
//! Runs full cached calls against the in-memory and SQLite stores with a
//! counting fake upstream, plus a store that injects faults.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use transit_cache::cache::{derive_key, CacheStats, EventKind, Timestamped};
use transit_cache::error::StoreResult;
use transit_cache::storage::{AtomRead, AtomWrite, CollectionRead, CollectionWrite, Row};
use transit_cache::{
    spawn_stats_task, CacheEngine, CacheError, CachePolicy, CallOptions, KeyArg, Location,
    MemoryStore, SqliteStore, Storage, StoreError, Window,
};

// == Helper Functions ==

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// A whole minute one hour from now.
fn base_time() -> DateTime<Utc> {
    (Utc::now() + chrono::Duration::hours(1))
        .duration_trunc(chrono::Duration::minutes(1))
        .unwrap()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Departure {
    when: DateTime<Utc>,
    line: String,
}

impl Timestamped for Departure {
    fn timestamp(&self) -> DateTime<Utc> {
        self.when
    }
}

/// Fake transit API counting how often each method was called.
#[derive(Default)]
struct Upstream {
    journeys: AtomicUsize,
    departures: AtomicUsize,
}

impl Upstream {
    async fn journeys(&self, from: &str, to: &str) -> anyhow::Result<Vec<String>> {
        self.journeys.fetch_add(1, Ordering::SeqCst);
        Ok(vec![format!("{} -> {}", from, to)])
    }

    /// One departure per minute over the window, ends included.
    async fn departures(&self, window: Window) -> anyhow::Result<Vec<Departure>> {
        self.departures.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::new();
        let mut t = window.start;
        while t <= window.end() {
            out.push(Departure {
                when: t,
                line: format!("U{}", out.len() % 9),
            });
            t += chrono::Duration::minutes(1);
        }
        Ok(out)
    }

    fn journeys_calls(&self) -> usize {
        self.journeys.load(Ordering::SeqCst)
    }

    fn departures_calls(&self) -> usize {
        self.departures.load(Ordering::SeqCst)
    }
}

fn journey_args(t: DateTime<Utc>) -> Vec<KeyArg> {
    vec![
        KeyArg::from(Location::stop("900000100003")),
        KeyArg::from(Location::stop("900000024101")),
        KeyArg::map([("departure", KeyArg::from(t))]),
    ]
}

fn departure_args() -> Vec<KeyArg> {
    vec![
        KeyArg::from(Location::stop("900000100003")),
        KeyArg::map(Vec::<(String, KeyArg)>::new()),
    ]
}

async fn departures(
    engine: &CacheEngine,
    upstream: &Upstream,
    window: Window,
) -> transit_cache::Result<transit_cache::Cached<Vec<Departure>>> {
    engine
        .collection_items("departures", &departure_args(), window, CallOptions::default(), || {
            upstream.departures(window)
        })
        .await
}

// == Fault Injection ==

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fault {
    None,
    Transient,
    Contract,
}

impl Fault {
    fn check(self, op: &str) -> StoreResult<()> {
        match self {
            Fault::None => Ok(()),
            Fault::Transient => Err(StoreError::Transient(format!("{}: connection reset", op))),
            Fault::Contract => Err(StoreError::ContractViolation(format!("{}: type mismatch", op))),
        }
    }
}

/// Memory store with a configurable fault per operation.
struct FaultyStore {
    inner: MemoryStore,
    init: Fault,
    read: Fault,
    write: Fault,
    init_calls: AtomicUsize,
}

impl FaultyStore {
    fn new(init: Fault, read: Fault, write: Fault) -> Self {
        Self {
            inner: MemoryStore::default(),
            init,
            read,
            write,
            init_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Storage for FaultyStore {
    async fn init(&self) -> StoreResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.init.check("init")
    }

    async fn read_atom(&self, query: &AtomRead<'_>) -> StoreResult<Option<String>> {
        self.read.check("read_atom")?;
        self.inner.read_atom(query).await
    }

    async fn write_atom(&self, entry: &AtomWrite<'_>) -> StoreResult<()> {
        self.write.check("write_atom")?;
        self.inner.write_atom(entry).await
    }

    async fn read_collection(&self, query: &CollectionRead<'_>) -> StoreResult<Option<Vec<Row>>> {
        self.read.check("read_collection")?;
        self.inner.read_collection(query).await
    }

    async fn write_collection(&self, entry: &CollectionWrite<'_>) -> StoreResult<()> {
        self.write.check("write_collection")?;
        self.inner.write_collection(entry).await
    }
}

// == Shared Scenarios ==

async fn repeated_atomic_call_hits(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let t = base_time();

    let first = engine
        .atomic("journeys", &journey_args(t), || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    let second = engine
        .atomic("journeys", &journey_args(t), || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();

    assert_eq!(upstream.journeys_calls(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.value, second.value);
}

async fn sub_window_served_from_cache(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let t = base_time();

    let wide = departures(&engine, &upstream, Window::new(t, minutes(10)))
        .await
        .unwrap();
    assert!(!wide.cached);
    assert_eq!(wide.len(), 11);

    let narrow_start = t + chrono::Duration::minutes(3);
    let narrow = departures(&engine, &upstream, Window::new(narrow_start, minutes(3)))
        .await
        .unwrap();

    assert_eq!(upstream.departures_calls(), 1);
    assert!(narrow.cached);
    let expected: Vec<Departure> = wide
        .value
        .iter()
        .filter(|d| d.when >= narrow_start && d.when <= narrow_start + chrono::Duration::minutes(3))
        .cloned()
        .collect();
    assert_eq!(expected.len(), 4);
    assert_eq!(narrow.value, expected);
}

async fn wider_window_misses(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let t = base_time();

    departures(&engine, &upstream, Window::new(t, minutes(5)))
        .await
        .unwrap();
    let wider = departures(&engine, &upstream, Window::new(t, minutes(10)))
        .await
        .unwrap();

    assert_eq!(upstream.departures_calls(), 2);
    assert!(!wider.cached);
    assert_eq!(wider.len(), 11);

    // the wider window now covers the narrower one
    let again = departures(&engine, &upstream, Window::new(t, minutes(5)))
        .await
        .unwrap();
    assert!(again.cached);
    assert_eq!(upstream.departures_calls(), 2);
}

async fn same_second_windows_coexist(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let t = base_time();

    departures(&engine, &upstream, Window::new(t, minutes(10)))
        .await
        .unwrap();
    departures(&engine, &upstream, Window::new(t + chrono::Duration::minutes(20), minutes(10)))
        .await
        .unwrap();
    let inside_first = departures(&engine, &upstream, Window::new(t + chrono::Duration::minutes(3), minutes(3)))
        .await
        .unwrap();

    assert!(inside_first.cached);
    assert_eq!(inside_first.len(), 4);
    assert_eq!(upstream.departures_calls(), 2);
}

async fn concurrent_identical_calls(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let t = base_time();
    let args = journey_args(t);
    let window = Window::new(t, minutes(10));

    let (a, b) = tokio::join!(
        engine.atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm")),
        engine.atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm")),
    );
    assert_eq!(a.unwrap().value, b.unwrap().value);
    assert!(upstream.journeys_calls() <= 2);

    let (c, d) = tokio::join!(
        departures(&engine, &upstream, window),
        departures(&engine, &upstream, window),
    );
    assert_eq!(c.unwrap().value, d.unwrap().value);
    assert!(upstream.departures_calls() <= 2);

    let journeys_before = upstream.journeys_calls();
    let departures_before = upstream.departures_calls();
    let later = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    let later_window = departures(&engine, &upstream, window).await.unwrap();

    assert!(later.cached);
    assert!(later_window.cached);
    assert_eq!(upstream.journeys_calls(), journeys_before);
    assert_eq!(upstream.departures_calls(), departures_before);
}

async fn collection_bypass_refetches_and_stores(storage: Arc<dyn Storage>) {
    let engine = CacheEngine::new(storage, CachePolicy::default());
    let upstream = Upstream::default();
    let window = Window::new(base_time(), minutes(10));

    departures(&engine, &upstream, window).await.unwrap();
    let bypassed = engine
        .collection_items(
            "departures",
            &departure_args(),
            window,
            CallOptions::bypass(),
            || upstream.departures(window),
        )
        .await
        .unwrap();
    assert!(!bypassed.cached);
    assert_eq!(bypassed.len(), 11);
    assert_eq!(upstream.departures_calls(), 2);

    let narrower = departures(
        &engine,
        &upstream,
        Window::new(window.start + chrono::Duration::minutes(2), minutes(5)),
    )
    .await
    .unwrap();
    assert!(narrower.cached);
    assert_eq!(narrower.len(), 6);
    assert_eq!(upstream.departures_calls(), 2);
}

// == Memory Store ==

#[tokio::test]
async fn test_memory_repeated_atomic_call_hits() {
    init_tracing();
    repeated_atomic_call_hits(Arc::new(MemoryStore::default())).await;
}

#[tokio::test]
async fn test_memory_sub_window_served_from_cache() {
    init_tracing();
    sub_window_served_from_cache(Arc::new(MemoryStore::default())).await;
}

#[tokio::test]
async fn test_memory_wider_window_misses() {
    init_tracing();
    wider_window_misses(Arc::new(MemoryStore::default())).await;
}

// == SQLite Store ==

#[tokio::test]
async fn test_sqlite_repeated_atomic_call_hits() {
    init_tracing();
    repeated_atomic_call_hits(Arc::new(SqliteStore::memory().unwrap())).await;
}

#[tokio::test]
async fn test_sqlite_sub_window_served_from_cache() {
    init_tracing();
    sub_window_served_from_cache(Arc::new(SqliteStore::memory().unwrap())).await;
}

#[tokio::test]
async fn test_sqlite_wider_window_misses() {
    init_tracing();
    wider_window_misses(Arc::new(SqliteStore::memory().unwrap())).await;
}

// == Every Store ==

#[tokio::test]
async fn test_same_second_windows_coexist_on_every_store() {
    init_tracing();
    same_second_windows_coexist(Arc::new(MemoryStore::default())).await;
    same_second_windows_coexist(Arc::new(SqliteStore::memory().unwrap())).await;
}

#[tokio::test]
async fn test_concurrent_identical_calls_on_every_store() {
    init_tracing();
    concurrent_identical_calls(Arc::new(MemoryStore::default())).await;
    concurrent_identical_calls(Arc::new(SqliteStore::memory().unwrap())).await;
}

#[tokio::test]
async fn test_collection_bypass_on_every_store() {
    init_tracing();
    collection_bypass_refetches_and_stores(Arc::new(MemoryStore::default())).await;
    collection_bypass_refetches_and_stores(Arc::new(SqliteStore::memory().unwrap())).await;
}

// == Freshness ==

#[tokio::test]
async fn test_entry_expires_after_period() {
    init_tracing();
    let policy = CachePolicy::default().with_period("journeys", Duration::from_secs(1));
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), policy);
    let upstream = Upstream::default();
    let args = journey_args(base_time());

    engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let later = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();

    assert!(!later.cached);
    assert_eq!(upstream.journeys_calls(), 2);
}

#[tokio::test]
async fn test_bypass_fetches_but_still_stores() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let upstream = Upstream::default();
    let args = journey_args(base_time());

    engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    let bypassed = engine
        .atomic_with("journeys", &args, CallOptions::bypass(), || {
            upstream.journeys("Zoo", "Mehringdamm")
        })
        .await
        .unwrap();
    assert!(!bypassed.cached);
    assert_eq!(upstream.journeys_calls(), 2);

    let after = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    assert!(after.cached);
    assert_eq!(upstream.journeys_calls(), 2);
}

#[tokio::test]
async fn test_never_cache_skips_storage() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let engine = CacheEngine::new(store.clone(), CachePolicy::default().never_cache("journeys"));
    let upstream = Upstream::default();
    let args = journey_args(base_time());

    for _ in 0..3 {
        let r = engine
            .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
            .await
            .unwrap();
        assert!(!r.cached);
    }

    assert_eq!(upstream.journeys_calls(), 3);
    assert_eq!(store.stats().await.entries, 0);
}

#[tokio::test]
async fn test_empty_collection_result_misses_next_time() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let calls = AtomicUsize::new(0);
    let window = Window::new(base_time(), minutes(10));

    for _ in 0..2 {
        let r = engine
            .collection_items("departures", &departure_args(), window, CallOptions::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Vec<Departure>, anyhow::Error>(Vec::new())
            })
            .await
            .unwrap();
        assert!(r.is_empty());
        assert!(!r.cached);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// == Errors ==

#[tokio::test]
async fn test_upstream_error_propagates_and_is_not_cached() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let args = journey_args(base_time());

    let err = engine
        .atomic("journeys", &args, || async {
            Err::<Vec<String>, _>(anyhow::anyhow!("HAFAS: service unavailable"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Upstream(_)));
    assert_eq!(err.upstream().unwrap().to_string(), "HAFAS: service unavailable");

    let upstream = Upstream::default();
    let retry = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    assert!(!retry.cached);
    assert_eq!(upstream.journeys_calls(), 1);
}

#[tokio::test]
async fn test_transient_read_fault_falls_back_to_upstream() {
    init_tracing();
    let engine = CacheEngine::new(
        Arc::new(FaultyStore::new(Fault::None, Fault::Transient, Fault::None)),
        CachePolicy::default(),
    );
    let upstream = Upstream::default();
    let window = Window::new(base_time(), minutes(10));

    let first = departures(&engine, &upstream, window).await.unwrap();
    let second = departures(&engine, &upstream, window).await.unwrap();

    assert_eq!(first.len(), 11);
    assert!(!second.cached);
    assert_eq!(upstream.departures_calls(), 2);
}

#[tokio::test]
async fn test_transient_write_fault_is_ignored() {
    init_tracing();
    let engine = CacheEngine::new(
        Arc::new(FaultyStore::new(Fault::None, Fault::None, Fault::Transient)),
        CachePolicy::default(),
    );
    let upstream = Upstream::default();

    let r = engine
        .atomic("journeys", &journey_args(base_time()), || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    assert_eq!(r.value, vec!["Zoo -> Mehringdamm".to_string()]);
}

#[tokio::test]
async fn test_contract_violation_on_read_rejects() {
    init_tracing();
    let engine = CacheEngine::new(
        Arc::new(FaultyStore::new(Fault::None, Fault::Contract, Fault::None)),
        CachePolicy::default(),
    );
    let upstream = Upstream::default();

    let err = engine
        .atomic("journeys", &journey_args(base_time()), || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Storage(StoreError::ContractViolation(_))));
    assert_eq!(upstream.journeys_calls(), 0);
}

#[tokio::test]
async fn test_transient_init_fault_is_retried() {
    init_tracing();
    let store = Arc::new(FaultyStore::new(Fault::Transient, Fault::None, Fault::None));
    let engine = CacheEngine::new(store.clone(), CachePolicy::default());
    let upstream = Upstream::default();
    let args = journey_args(base_time());

    for _ in 0..2 {
        engine
            .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
            .await
            .unwrap();
    }

    assert_eq!(upstream.journeys_calls(), 2);
    // once before the read and once before the write, per call
    assert_eq!(store.init_calls.load(Ordering::SeqCst), 4);
    assert!(engine.init().await.is_err());
}

#[tokio::test]
async fn test_contract_violation_on_init_rejects() {
    init_tracing();
    let engine = CacheEngine::new(
        Arc::new(FaultyStore::new(Fault::Contract, Fault::None, Fault::None)),
        CachePolicy::default(),
    );
    let upstream = Upstream::default();

    let err = engine
        .atomic("journeys", &journey_args(base_time()), || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Storage(StoreError::ContractViolation(_))));
}

#[tokio::test]
async fn test_stored_payload_decoding() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let engine = CacheEngine::new(store.clone(), CachePolicy::default());
    let upstream = Upstream::default();
    let args = journey_args(base_time());
    let key = derive_key("journeys", &args).unwrap();

    let plant = |value: &'static str| {
        let store = store.clone();
        let key = key.clone();
        async move {
            store
                .write_atom(&AtomWrite {
                    method: "journeys",
                    key: key.as_str(),
                    created_at: Utc::now().timestamp(),
                    ttl: Duration::from_secs(60),
                    value,
                })
                .await
                .unwrap();
        }
    };

    // unparsable payload: treated as a miss
    plant("{not json").await;
    let r = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap();
    assert!(!r.cached);
    assert_eq!(upstream.journeys_calls(), 1);

    // well-formed payload of the wrong shape: rejected
    plant("{\"journeys\": 3}").await;
    let err = engine
        .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Storage(StoreError::ContractViolation(_))));
    assert_eq!(upstream.journeys_calls(), 1);
}

#[tokio::test]
async fn test_invalid_key_argument_rejects() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let upstream = Upstream::default();

    let err = engine
        .atomic("journeys", &[KeyArg::from(f64::NAN)], || upstream.journeys("Zoo", "Mehringdamm"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument(_)));
    assert_eq!(upstream.journeys_calls(), 0);
}

// == Events ==

#[tokio::test]
async fn test_hit_and_miss_events() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let mut events = engine.subscribe();
    let upstream = Upstream::default();
    let t = base_time();

    departures(&engine, &upstream, Window::new(t, minutes(10)))
        .await
        .unwrap();
    departures(&engine, &upstream, Window::new(t, minutes(2)))
        .await
        .unwrap();

    let miss = events.try_recv().unwrap();
    assert_eq!(miss.kind, EventKind::Miss);
    assert_eq!(miss.method, "departures");
    assert_eq!(miss.args, departure_args());

    let hit = events.try_recv().unwrap();
    assert_eq!(hit.kind, EventKind::Hit);
    assert_eq!(hit.size, Some(3));

    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_stats_task_counts_engine_events() {
    init_tracing();
    let engine = CacheEngine::new(Arc::new(MemoryStore::default()), CachePolicy::default());
    let stats = Arc::new(tokio::sync::RwLock::new(CacheStats::new()));
    let handle = spawn_stats_task(engine.subscribe(), stats.clone());
    let upstream = Upstream::default();
    let args = journey_args(base_time());

    for _ in 0..4 {
        engine
            .atomic("journeys", &args, || upstream.journeys("Zoo", "Mehringdamm"))
            .await
            .unwrap();
    }
    drop(engine);
    handle.await.unwrap();

    let stats = stats.read().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.hit_rate(), 0.75);
}
