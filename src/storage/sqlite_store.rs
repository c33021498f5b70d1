//! SQLite Store Module
//!
//! Relational backend: collection windows live in a query-metadata table,
//! their items in a rows table referencing it, atoms in a third table.
//! rusqlite is blocking, so every call runs on the blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{named_params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::storage::{
    new_id, AtomRead, AtomWrite, CollectionRead, CollectionWrite, Row, Storage,
};

// Table names carry the data version (`_1`).
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collection_queries_1 (
    id          TEXT PRIMARY KEY,
    created     INTEGER NOT NULL,
    method      TEXT NOT NULL,
    key         TEXT NOT NULL,
    "when"      INTEGER NOT NULL,
    duration    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS collection_queries_1_lookup_idx
    ON collection_queries_1 (method, key, created);

CREATE TABLE IF NOT EXISTS collections_1 (
    id          TEXT PRIMARY KEY,
    query_id    TEXT NOT NULL REFERENCES collection_queries_1(id) ON DELETE CASCADE,
    "when"      INTEGER NOT NULL,
    idx         INTEGER NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS collections_1_query_id_idx
    ON collections_1 (query_id, "when");

CREATE TABLE IF NOT EXISTS atoms_1 (
    id          TEXT PRIMARY KEY,
    created     INTEGER NOT NULL,
    method      TEXT NOT NULL,
    key         TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS atoms_1_lookup_idx
    ON atoms_1 (method, key, created);
"#;

const FIND_COVERING_QUERY: &str = r#"
SELECT id FROM collection_queries_1
WHERE method = :method
  AND key = :key
  AND created >= :created_min
  AND created <= :created_max
  AND "when" <= :when_min
  AND ("when" + duration) >= :when_max
LIMIT 1
"#;

const READ_ROWS: &str = r#"
SELECT "when", data FROM collections_1
WHERE query_id = :query_id
  AND "when" >= :when_min
  AND "when" <= :when_max
ORDER BY "when", idx
"#;

const WRITE_COLLECTION_QUERY: &str = r#"
INSERT INTO collection_queries_1 (id, created, method, key, "when", duration)
VALUES (:id, :created, :method, :key, :when, :duration)
"#;

const WRITE_COLLECTION_ROW: &str = r#"
INSERT INTO collections_1 (id, query_id, "when", idx, data)
VALUES (:id, :query_id, :when, :idx, :data)
"#;

const READ_ATOM: &str = r#"
SELECT data FROM atoms_1
WHERE method = :method
  AND key = :key
  AND created >= :created_min
  AND created <= :created_max
LIMIT 1
"#;

const WRITE_ATOM: &str = r#"
INSERT INTO atoms_1 (id, created, method, key, data)
VALUES (:id, :created, :method, :key, :data)
"#;

// == SQLite Store ==
/// SQLite-backed `Storage`. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens a file-backed store.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    /// Creates an in-memory store (for testing).
    pub fn memory() -> StoreResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wraps a connection owned by the caller. Tables are created by `init`.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    // == Purge ==
    /// Physically deletes every query, row and atom created before `cutoff`
    /// (Unix seconds). Returns the number of queries and atoms removed.
    pub async fn purge_created_before(&self, cutoff: i64) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM collections_1 WHERE query_id IN \
                 (SELECT id FROM collection_queries_1 WHERE created < ?1)",
                [cutoff],
            )?;
            let queries = tx.execute("DELETE FROM collection_queries_1 WHERE created < ?1", [cutoff])?;
            let atoms = tx.execute("DELETE FROM atoms_1 WHERE created < ?1", [cutoff])?;
            tx.commit()?;
            Ok(queries + atoms)
        })
        .await
    }
}

fn lock(conn: &Mutex<Connection>) -> StoreResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StoreError::Transient("sqlite connection lock poisoned".to_string()))
}

#[async_trait]
impl Storage for SqliteStore {
    async fn init(&self) -> StoreResult<()> {
        debug!("sqlite: init");
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn read_atom(&self, query: &AtomRead<'_>) -> StoreResult<Option<String>> {
        debug!(method = query.method, key = query.key, "sqlite: read atom");
        let method = query.method.to_string();
        let key = query.key.to_string();
        let (created_min, created_max) = (query.created_min, query.created_max);

        self.with_conn(move |conn| {
            let data = conn
                .query_row(
                    READ_ATOM,
                    named_params! {
                        ":method": method,
                        ":key": key,
                        ":created_min": created_min,
                        ":created_max": created_max,
                    },
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(data)
        })
        .await
    }

    async fn write_atom(&self, entry: &AtomWrite<'_>) -> StoreResult<()> {
        debug!(method = entry.method, key = entry.key, created = entry.created_at, "sqlite: write atom");
        let method = entry.method.to_string();
        let key = entry.key.to_string();
        let value = entry.value.to_string();
        let created = entry.created_at;

        self.with_conn(move |conn| {
            conn.execute(
                WRITE_ATOM,
                named_params! {
                    ":id": new_id(),
                    ":created": created,
                    ":method": method,
                    ":key": key,
                    ":data": value,
                },
            )?;
            Ok(())
        })
        .await
    }

    async fn read_collection(&self, query: &CollectionRead<'_>) -> StoreResult<Option<Vec<Row>>> {
        debug!(
            method = query.method,
            key = query.key,
            when_min = query.when_min,
            when_max = query.when_max,
            "sqlite: read collection"
        );
        let method = query.method.to_string();
        let key = query.key.to_string();
        let q = (
            query.when_min,
            query.when_max,
            query.created_min,
            query.created_max,
        );

        self.with_conn(move |conn| {
            let (when_min, when_max, created_min, created_max) = q;
            let query_id: Option<String> = conn
                .query_row(
                    FIND_COVERING_QUERY,
                    named_params! {
                        ":method": method,
                        ":key": key,
                        ":created_min": created_min,
                        ":created_max": created_max,
                        ":when_min": when_min,
                        ":when_max": when_max,
                    },
                    |row| row.get(0),
                )
                .optional()?;

            let Some(query_id) = query_id else {
                return Ok(None);
            };

            let mut stmt = conn.prepare_cached(READ_ROWS)?;
            let rows = stmt.query_map(
                named_params! {
                    ":query_id": query_id,
                    ":when_min": when_min,
                    ":when_max": when_max,
                },
                |row| Ok(Row::from_secs(row.get(0)?, row.get(1)?)),
            )?;

            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(Some(out))
        })
        .await
    }

    async fn write_collection(&self, entry: &CollectionWrite<'_>) -> StoreResult<()> {
        debug!(
            method = entry.method,
            key = entry.key,
            when = entry.when,
            duration = entry.duration,
            rows = entry.rows.len(),
            "sqlite: write collection"
        );
        let method = entry.method.to_string();
        let key = entry.key.to_string();
        let (when, duration, created) = (entry.when, entry.duration, entry.created_at);
        let rows: Vec<(i64, String)> = entry
            .rows
            .iter()
            .map(|row| (row.when_secs(), row.data.clone()))
            .collect();

        self.with_conn(move |conn| {
            let query_id = new_id();
            // metadata first, then its rows
            let tx = conn.transaction()?;
            tx.execute(
                WRITE_COLLECTION_QUERY,
                named_params! {
                    ":id": query_id,
                    ":created": created,
                    ":method": method,
                    ":key": key,
                    ":when": when,
                    ":duration": duration,
                },
            )?;
            {
                let mut stmt = tx.prepare_cached(WRITE_COLLECTION_ROW)?;
                for (idx, (row_when, data)) in rows.iter().enumerate() {
                    stmt.execute(named_params! {
                        ":id": new_id(),
                        ":query_id": query_id,
                        ":when": row_when,
                        ":idx": idx as i64,
                        ":data": data,
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
