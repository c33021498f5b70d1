//! Cache Key Module
//!
//! Reduces an operation name plus its cache-relevant arguments to a stable,
//! fixed-length key. Arguments are canonicalized to text first: maps are
//! ordered by key, instants are normalized to UTC seconds and tagged
//! locations collapse to their identity.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, Result};

/// Length of a derived key in hex characters.
pub const KEY_LENGTH: usize = 32;

/// `type` tags recognized as locations when converting from JSON.
const LOCATION_TAGS: [&str; 3] = ["location", "stop", "station"];

// == Location ==
/// A place argument: either a known stop/station or a coordinate pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    /// A stop or station known by id.
    pub fn stop(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// An address or point of interest given by coordinates.
    pub fn point(address: Option<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            address,
            latitude: Some(latitude),
            longitude: Some(longitude),
            ..Self::default()
        }
    }

    fn canonical(&self) -> Result<String> {
        if let Some(id) = &self.id {
            return Ok(format!("loc({})", quote(id)));
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Ok(format!(
                "loc({}|{:.6}|{:.6})",
                quote(self.address.as_deref().unwrap_or_default()),
                lat,
                lon
            )),
            _ => Err(CacheError::InvalidArgument(
                "location needs an id or finite coordinates".to_string(),
            )),
        }
    }
}

// == Key Argument ==
/// Closed set of argument shapes that can take part in a cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Instant(DateTime<Utc>),
    List(Vec<KeyArg>),
    Map(BTreeMap<String, KeyArg>),
    Location(Location),
}

impl KeyArg {
    /// Builds a map argument, e.g. an options object.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, KeyArg)>,
    {
        KeyArg::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Converts a JSON value.
    ///
    /// Strings holding RFC 3339 timestamps become instants and objects tagged
    /// `"type": "location" | "stop" | "station"` become locations.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        Ok(match value {
            Value::Null => KeyArg::Null,
            Value::Bool(b) => KeyArg::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyArg::Int(i),
                None => KeyArg::Float(n.as_f64().ok_or_else(|| {
                    CacheError::InvalidArgument(format!("unsupported number {}", n))
                })?),
            },
            Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => KeyArg::Instant(t.with_timezone(&Utc)),
                Err(_) => KeyArg::Text(s),
            },
            Value::Array(items) => KeyArg::List(
                items
                    .into_iter()
                    .map(KeyArg::from_json)
                    .collect::<Result<_>>()?,
            ),
            Value::Object(obj) => {
                let tagged = obj
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| LOCATION_TAGS.contains(&t));
                if tagged {
                    KeyArg::Location(location_from_json(obj)?)
                } else {
                    KeyArg::Map(
                        obj.into_iter()
                            .map(|(k, v)| Ok((k, KeyArg::from_json(v)?)))
                            .collect::<Result<_>>()?,
                    )
                }
            }
        })
    }

    /// Converts any serializable value via its JSON form.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;
        Self::from_json(json)
    }

    /// First instant found in this argument, depth-first.
    pub fn first_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            KeyArg::Instant(t) => Some(*t),
            KeyArg::List(items) => items.iter().find_map(KeyArg::first_instant),
            KeyArg::Map(entries) => entries.values().find_map(KeyArg::first_instant),
            _ => None,
        }
    }

    fn write_canonical(&self, out: &mut String) -> Result<()> {
        match self {
            KeyArg::Null => out.push_str("null"),
            KeyArg::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            KeyArg::Int(i) => out.push_str(&i.to_string()),
            KeyArg::Float(f) => {
                if !f.is_finite() {
                    return Err(CacheError::InvalidArgument(format!(
                        "non-finite number {}",
                        f
                    )));
                }
                out.push_str(&f.to_string());
            }
            KeyArg::Text(s) => out.push_str(&quote(s)),
            KeyArg::Instant(t) => out.push_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            KeyArg::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out)?;
                }
                out.push(']');
            }
            KeyArg::Map(entries) => {
                // BTreeMap iterates in key order
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&quote(k));
                    out.push(':');
                    v.write_canonical(out)?;
                }
                out.push('}');
            }
            KeyArg::Location(loc) => out.push_str(&loc.canonical()?),
        }
        Ok(())
    }
}

fn location_from_json(mut obj: serde_json::Map<String, serde_json::Value>) -> Result<Location> {
    use serde_json::Value;

    // hafas-style stops nest their coordinates under `location`
    let nested = match obj.remove("location") {
        Some(Value::Object(inner)) => Some(inner),
        _ => None,
    };
    let coord = |name: &str| {
        obj.get(name)
            .or_else(|| nested.as_ref().and_then(|n| n.get(name)))
            .and_then(Value::as_f64)
    };
    let text = |name: &str| match obj.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let location = Location {
        id: text("id"),
        name: text("name"),
        address: text("address"),
        latitude: coord("latitude"),
        longitude: coord("longitude"),
    };
    // fail early on shapes that cannot be keyed
    location.canonical()?;
    Ok(location)
}

fn quote(s: &str) -> String {
    // JSON string escaping keeps separators unambiguous
    serde_json::Value::String(s.to_string()).to_string()
}

// == Conversions ==
impl From<&str> for KeyArg {
    fn from(s: &str) -> Self {
        KeyArg::Text(s.to_string())
    }
}

impl From<String> for KeyArg {
    fn from(s: String) -> Self {
        KeyArg::Text(s)
    }
}

impl From<bool> for KeyArg {
    fn from(b: bool) -> Self {
        KeyArg::Bool(b)
    }
}

impl From<i64> for KeyArg {
    fn from(i: i64) -> Self {
        KeyArg::Int(i)
    }
}

impl From<u32> for KeyArg {
    fn from(i: u32) -> Self {
        KeyArg::Int(i64::from(i))
    }
}

impl From<f64> for KeyArg {
    fn from(f: f64) -> Self {
        KeyArg::Float(f)
    }
}

impl From<DateTime<Utc>> for KeyArg {
    fn from(t: DateTime<Utc>) -> Self {
        KeyArg::Instant(t)
    }
}

impl From<Location> for KeyArg {
    fn from(loc: Location) -> Self {
        KeyArg::Location(loc)
    }
}

impl<T: Into<KeyArg>> From<Option<T>> for KeyArg {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyArg::Null, Into::into)
    }
}

impl<T: Into<KeyArg>> From<Vec<T>> for KeyArg {
    fn from(items: Vec<T>) -> Self {
        KeyArg::List(items.into_iter().map(Into::into).collect())
    }
}

// == Cache Key ==
/// Fixed-length hex digest identifying one logical query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical text of an argument list, as hashed by `derive_key`.
pub fn canonicalize(args: &[KeyArg]) -> Result<String> {
    let mut out = String::new();
    KeyArg::List(args.to_vec()).write_canonical(&mut out)?;
    Ok(out)
}

// == Derive Key ==
/// Hashes `method` and `args` into a `CacheKey`.
///
/// Fails with `CacheError::InvalidArgument` for shapes that cannot be keyed.
pub fn derive_key(method: &str, args: &[KeyArg]) -> Result<CacheKey> {
    let canonical = canonicalize(args)?;
    let mut h = Sha256::new();
    h.update(method.as_bytes());
    h.update(b"\n");
    h.update(canonical.as_bytes());
    let mut digest = hex::encode(h.finalize());
    digest.truncate(KEY_LENGTH);
    Ok(CacheKey(digest))
}
