//! Storage ports for the two tiers
//!
//! - `hot` - low-latency transactional store (SQLite) for recent records
//! - `cold` - durable object store holding full-overwrite JSON collections
//! - `retry` - timeout + exponential backoff wrapper for cold-store calls
//!
//! Both ports speak in terms of [`CompositeKey`], the identity used to
//! deduplicate records whenever two record sets are merged.

pub mod cold;
pub mod hot;
pub mod retry;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use cold::{ColdStore, FsColdStore, MemoryColdStore, StoredObject, WriteCondition};
pub use hot::{run_schema_migrations, HotDocument, HotFilter, HotStore, MemoryHotStore, SqliteHotStore};
pub use retry::{ExponentialBackoff, ResilientColdStore, RetryPolicy};

/// Interval tag used in keys of raw readings (not bucketed)
pub const RAW_INTERVAL: &str = "raw";

#[derive(Debug)]
pub enum StoreError {
    /// Requested object or record is absent (callers treat this as empty)
    NotFound(String),
    /// Timeout or connectivity failure; the unit of work is retried on the next run
    Transient(String),
    /// Conditional cold write lost a race with another writer
    PreconditionFailed(String),
    Database(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "Not found: {}", what),
            StoreError::Transient(e) => write!(f, "Transient store error: {}", e),
            StoreError::PreconditionFailed(e) => write!(f, "Precondition failed: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Deduplication identity of a record across tiers
///
/// Readings use `interval = "raw"` and the reading instant as `bucket_ms`;
/// interval buckets and delta records use the UTC start of their bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub entity_id: String,
    pub sub_entity: String,
    pub interval: String,
    pub bucket_ms: i64,
}

impl CompositeKey {
    pub fn new(
        entity_id: impl Into<String>,
        sub_entity: impl Into<String>,
        interval: impl Into<String>,
        bucket_ms: i64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            sub_entity: sub_entity.into(),
            interval: interval.into(),
            bucket_ms,
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.entity_id, self.sub_entity, self.interval, self.bucket_ms
        )
    }
}
