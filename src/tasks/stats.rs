//! Stats Task
//!
//! Background task that keeps `CacheStats` up to date from an engine's
//! event stream.

use std::sync::Arc;

use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEvent, CacheStats};

/// Spawns a task recording every event from `events` into `stats`.
///
/// The task ends when the engine owning the channel is dropped. Events lost
/// to a lagging receiver are logged and not counted.
///
/// # Example
/// ```ignore
/// let stats = Arc::new(RwLock::new(CacheStats::new()));
/// let stats_handle = spawn_stats_task(engine.subscribe(), stats.clone());
/// ```
pub fn spawn_stats_task(mut events: Receiver<CacheEvent>, stats: Arc<RwLock<CacheStats>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting stats task");

        loop {
            match events.recv().await {
                Ok(event) => stats.write().await.record(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Stats task lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        let stats = stats.read().await;
        info!(
            hits = stats.hits,
            misses = stats.misses,
            "Stats task finished, hit rate {:.2}",
            stats.hit_rate()
        );
    })
}
