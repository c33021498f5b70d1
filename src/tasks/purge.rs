//! Purge Task
//!
//! Background task that periodically deletes SQLite entries older than a
//! maximum age. Expired entries are never served either way; this only
//! bounds the size of the database file.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::SqliteStore;

/// Spawns a background task that purges old entries from `store`.
///
/// Every `interval`, entries created more than `max_age` ago are deleted.
/// Purge failures are logged and retried on the next run.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let store = SqliteStore::open(Path::new("cache.db"))?;
/// let purge_handle = spawn_purge_task(store.clone(), config.purge_interval, config.purge_max_age);
/// // Later, during shutdown:
/// purge_handle.abort();
/// ```
pub fn spawn_purge_task(store: SqliteStore, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);

    tokio::spawn(async move {
        info!(
            "Starting purge task with interval of {:?}, max age {:?}",
            interval, max_age
        );

        loop {
            tokio::time::sleep(interval).await;

            let cutoff = Utc::now().timestamp().saturating_sub(max_age_secs);
            match store.purge_created_before(cutoff).await {
                Ok(0) => debug!("Purge: no old entries found"),
                Ok(removed) => info!("Purge: removed {} old entries", removed),
                Err(e) => warn!(error = %e, "Purge failed"),
            }
        }
    })
}
