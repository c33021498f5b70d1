//! Redis Store Module
//!
//! Key-scan backend. Relationships live in the key layout:
//!
//! ```text
//! {version}:a:{method}:{key}:{created}      -> serialized value
//! {version}:c:{method}:{key}:{created}:{collection_id} -> {collection_id}:{when}:{duration}
//! {version}:r:{collection_id}:{when}:{idx}  -> serialized row
//! ```
//!
//! Lookups run as Lua scripts so the scan, the covering check and the row
//! fetch happen in one round trip and cannot interleave with writers.
//! Every key is written with a TTL equal to the cache period.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::storage::{
    new_id, AtomRead, AtomWrite, CollectionRead, CollectionWrite, Row, Storage, ATOMS,
    COLLECTIONS, COLLECTION_ROWS, DATA_VERSION,
};

/// SCAN batch size used inside the scripts.
const SCAN_COUNT: u32 = 100;

// ARGV: pattern, prefix length, created_min, created_max, scan count
const READ_MATCHING_ATOM: &str = r#"
local pattern = ARGV[1]
local prefix_len = tonumber(ARGV[2])
local created_min = tonumber(ARGV[3])
local created_max = tonumber(ARGV[4])
local cursor = "0"
repeat
    local res = redis.call("SCAN", cursor, "MATCH", pattern, "COUNT", ARGV[5])
    cursor = res[1]
    for _, key in ipairs(res[2]) do
        local created = tonumber(string.sub(key, prefix_len + 1))
        if created and created >= created_min and created <= created_max then
            local val = redis.call("GET", key)
            if val then
                return val
            end
        end
    end
until cursor == "0"
return false
"#;

// ARGV: pattern, prefix length, created_min, created_max, when_min, when_max,
//       rows prefix, scan count
// Metadata keys end in `{created}:{collection_id}`, so several windows
// written in the same second coexist.
// Returns false if no stored window covers the request, otherwise a flat
// list of when/data pairs ordered by when, then write index.
const READ_MATCHING_COLLECTION: &str = r#"
local pattern = ARGV[1]
local prefix_len = tonumber(ARGV[2])
local created_min = tonumber(ARGV[3])
local created_max = tonumber(ARGV[4])
local when_min = tonumber(ARGV[5])
local when_max = tonumber(ARGV[6])
local rows_prefix = ARGV[7]
local count = ARGV[8]

local collection_id = nil
local cursor = "0"
repeat
    local res = redis.call("SCAN", cursor, "MATCH", pattern, "COUNT", count)
    cursor = res[1]
    for _, key in ipairs(res[2]) do
        local created = tonumber(string.match(key, "^(-?%d+):", prefix_len + 1))
        if created and created >= created_min and created <= created_max then
            local meta = redis.call("GET", key)
            if meta then
                local id, w, d = string.match(meta, "^([^:]+):(-?%d+):(-?%d+)$")
                w = tonumber(w)
                d = tonumber(d)
                if id and w and d and w <= when_min and (w + d) >= when_max then
                    collection_id = id
                    break
                end
            end
        end
    end
until collection_id or cursor == "0"

if not collection_id then
    return false
end

local prefix = rows_prefix .. collection_id .. ":"
local rows = {}
cursor = "0"
repeat
    local res = redis.call("SCAN", cursor, "MATCH", prefix .. "*", "COUNT", count)
    cursor = res[1]
    for _, key in ipairs(res[2]) do
        local w, i = string.match(string.sub(key, #prefix + 1), "^(-?%d+):(%d+)$")
        w = tonumber(w)
        i = tonumber(i)
        if w and i and w >= when_min and w <= when_max then
            local data = redis.call("GET", key)
            if data then
                table.insert(rows, {w, i, data})
            end
        end
    end
until cursor == "0"

table.sort(rows, function(a, b)
    if a[1] == b[1] then
        return a[2] < b[2]
    end
    return a[1] < b[1]
end)

local out = {}
for _, row in ipairs(rows) do
    table.insert(out, tostring(row[1]))
    table.insert(out, row[3])
end
return out
"#;

// == Redis Store ==
/// Redis-backed `Storage` over a shared, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    read_atom_script: Script,
    read_collection_script: Script,
}

impl RedisStore {
    /// Wraps a connection owned by the caller.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            read_atom_script: Script::new(READ_MATCHING_ATOM),
            read_collection_script: Script::new(READ_MATCHING_COLLECTION),
        }
    }

    /// Connects to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

/// Native TTL in whole seconds, rounded up so Redis never expires an entry
/// the engine would still serve. EX 0 is rejected by Redis.
fn ttl_secs(ttl: std::time::Duration) -> u64 {
    (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).max(1)
}

/// Prefix shared by all keys of one method/key pair in `family`.
fn key_prefix(family: &str, method: &str, key: &str) -> String {
    format!("{}:{}:{}:{}:", DATA_VERSION, family, method, key)
}

/// Escapes glob metacharacters for SCAN MATCH.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Longest common prefix of the decimal forms of both bounds.
///
/// Any integer between two bounds of the same digit count shares their
/// common prefix, so it narrows the scan without skipping keys.
fn common_prefix(min: i64, max: i64) -> String {
    let (a, b) = (min.to_string(), max.to_string());
    if a.len() != b.len() {
        return String::new();
    }
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// Builds the SCAN pattern for creation timestamps in `[min, max]`.
fn created_pattern(prefix: &str, min: i64, max: i64) -> String {
    format!("{}{}*", escape_glob(prefix), common_prefix(min, max))
}

/// Converts the flat when/data reply of the collection script into rows.
fn rows_from_reply(reply: Vec<String>) -> StoreResult<Vec<Row>> {
    if reply.len() % 2 != 0 {
        return Err(StoreError::ContractViolation(format!(
            "collection reply has odd length {}",
            reply.len()
        )));
    }
    let mut rows = Vec::with_capacity(reply.len() / 2);
    let mut it = reply.into_iter();
    while let (Some(when), Some(data)) = (it.next(), it.next()) {
        let when = when.parse::<i64>().map_err(|e| {
            StoreError::ContractViolation(format!("row timestamp {:?}: {}", when, e))
        })?;
        rows.push(Row::from_secs(when, data));
    }
    Ok(rows)
}

#[async_trait]
impl Storage for RedisStore {
    async fn init(&self) -> StoreResult<()> {
        debug!("redis: init");
        let mut conn = self.conn.clone();
        // loads both scripts so the first lookup can use EVALSHA
        self.read_atom_script
            .prepare_invoke()
            .load_async(&mut conn)
            .await?;
        self.read_collection_script
            .prepare_invoke()
            .load_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_atom(&self, query: &AtomRead<'_>) -> StoreResult<Option<String>> {
        debug!(method = query.method, key = query.key, "redis: read atom");
        let prefix = key_prefix(ATOMS, query.method, query.key);
        let mut conn = self.conn.clone();

        let value: Option<String> = self
            .read_atom_script
            .arg(created_pattern(&prefix, query.created_min, query.created_max))
            .arg(prefix.len())
            .arg(query.created_min)
            .arg(query.created_max)
            .arg(SCAN_COUNT)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn write_atom(&self, entry: &AtomWrite<'_>) -> StoreResult<()> {
        debug!(method = entry.method, key = entry.key, created = entry.created_at, "redis: write atom");
        let key = format!(
            "{}{}",
            key_prefix(ATOMS, entry.method, entry.key),
            entry.created_at
        );
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(entry.value)
            .arg("EX")
            .arg(ttl_secs(entry.ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_collection(&self, query: &CollectionRead<'_>) -> StoreResult<Option<Vec<Row>>> {
        debug!(
            method = query.method,
            key = query.key,
            when_min = query.when_min,
            when_max = query.when_max,
            "redis: read collection"
        );
        let prefix = key_prefix(COLLECTIONS, query.method, query.key);
        let rows_prefix = format!("{}:{}:", DATA_VERSION, COLLECTION_ROWS);
        let mut conn = self.conn.clone();

        let reply: Option<Vec<String>> = self
            .read_collection_script
            .arg(created_pattern(&prefix, query.created_min, query.created_max))
            .arg(prefix.len())
            .arg(query.created_min)
            .arg(query.created_max)
            .arg(query.when_min)
            .arg(query.when_max)
            .arg(rows_prefix)
            .arg(SCAN_COUNT)
            .invoke_async(&mut conn)
            .await?;

        reply.map(rows_from_reply).transpose()
    }

    async fn write_collection(&self, entry: &CollectionWrite<'_>) -> StoreResult<()> {
        debug!(
            method = entry.method,
            key = entry.key,
            when = entry.when,
            duration = entry.duration,
            rows = entry.rows.len(),
            "redis: write collection"
        );
        let ttl = ttl_secs(entry.ttl);
        let collection_id = new_id();
        let meta_key = format!(
            "{}{}:{}",
            key_prefix(COLLECTIONS, entry.method, entry.key),
            entry.created_at,
            collection_id
        );

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (idx, row) in entry.rows.iter().enumerate() {
            let row_key = format!(
                "{}:{}:{}:{}:{}",
                DATA_VERSION,
                COLLECTION_ROWS,
                collection_id,
                row.when_secs(),
                idx
            );
            pipe.cmd("SET")
                .arg(row_key)
                .arg(&row.data)
                .arg("EX")
                .arg(ttl)
                .ignore();
        }
        // metadata last: readers never find a window whose rows are missing
        pipe.cmd("SET")
            .arg(meta_key)
            .arg(format!(
                "{}:{}:{}",
                collection_id, entry.when, entry.duration
            ))
            .arg("EX")
            .arg(ttl)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
