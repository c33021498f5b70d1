//! Error types for the caching layer
//!
//! Provides unified error handling using thiserror. Storage faults are split
//! into transient faults, which the engine swallows, and contract violations,
//! which always reach the caller.

use thiserror::Error;

// == Store Error Enum ==
/// Error raised by a `Storage` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection loss, timeouts, corrupt payloads and the like
    #[error("Transient storage fault: {0}")]
    Transient(String),

    /// Type mismatch, invalid reference or out-of-range value
    #[error("Storage contract violation: {0}")]
    ContractViolation(String),
}

impl StoreError {
    /// Returns true for faults that indicate a broken adapter.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, StoreError::ContractViolation(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match e {
            E::InvalidColumnType(..)
            | E::InvalidColumnIndex(_)
            | E::InvalidColumnName(_)
            | E::IntegralValueOutOfRange(..)
            | E::FromSqlConversionFailure(..)
            | E::InvalidParameterName(_)
            | E::InvalidParameterCount(..) => StoreError::ContractViolation(e.to_string()),
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError => StoreError::ContractViolation(e.to_string()),
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            // valid JSON of the wrong shape
            serde_json::error::Category::Data => StoreError::ContractViolation(e.to_string()),
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Transient(format!("blocking task failed: {}", e))
    }
}

// == Cache Error Enum ==
/// Error returned from a cached call.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Malformed query arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage contract violation surfaced by the engine
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// A fetched value could not be serialized for storage
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The wrapped upstream call failed; the original error is preserved
    #[error(transparent)]
    Upstream(anyhow::Error),
}

impl CacheError {
    /// Returns the upstream error if this call failed upstream.
    pub fn upstream(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

// == Result Type Aliases ==
/// Convenience Result type for cached calls.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Convenience Result type for storage adapters.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
