//! Stream Store Adapter.
//!
//! Thin client abstraction over the external append-only log store. The
//! store's consumer-group primitive is the mutual-exclusion mechanism for
//! delivery; the broker adds no locking of its own on that path.
//!
//! Implementations:
//! - `RedisStreamStore`: Redis Streams (feature `redis`, default)
//! - `MemoryStreamStore`: in-process store for tests and standalone runs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::StoreConfig;
use crate::Result;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStreamStore;
#[cfg(feature = "redis")]
pub use redis::RedisStreamStore;

/// Identifier assigned by the store to an appended entry.
pub type EntryId = String;

/// Sidecar fields written alongside the serialized envelope on a stream
/// entry: `payload`, `priority`, `source`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    /// Serialized envelope (or retry envelope, on retry streams).
    pub payload: String,
    pub priority: String,
    pub source: String,
}

impl WireEntry {
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("payload", &self.payload),
            ("priority", &self.priority),
            ("source", &self.source),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            payload: fields.get("payload")?.clone(),
            priority: fields
                .get("priority")
                .cloned()
                .unwrap_or_else(|| "normal".to_string()),
            source: fields.get("source").cloned().unwrap_or_default(),
        })
    }
}

/// An entry read from a stream on behalf of a consumer group.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: EntryId,
    pub entry: WireEntry,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Beginning,
    Latest,
    /// Entries appended at or after this instant.
    Timestamp(i64),
}

impl StartFrom {
    /// Stream cursor id for group creation.
    pub fn as_cursor(&self) -> String {
        match self {
            StartFrom::Beginning => "0".to_string(),
            StartFrom::Latest => "$".to_string(),
            StartFrom::Timestamp(millis) => format!("{}-0", millis),
        }
    }
}

/// Stream retention policy, enforced by continuous trimming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Retention {
    /// Keep at most this many entries (approximate).
    MaxLen(u64),
    /// Keep entries younger than this.
    MaxAge(Duration),
    /// Both bounds.
    Both { max_len: u64, max_age: Duration },
}

/// Interface to the durable log store.
///
/// Append is atomic at the store level: a failed `append` has written
/// nothing.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append an entry to `stream`, creating the stream if absent.
    async fn append(&self, stream: &str, entry: WireEntry) -> Result<EntryId>;

    /// Idempotently create `group` on `stream` starting at `start`,
    /// creating the stream if absent.
    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()>;

    /// Blocking read of up to `count` new messages for `consumer` within
    /// `group`. Blocks cooperatively for at most `block` waiting for data.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoredEntry>>;

    /// Acknowledge `ids` for `group` in one pipelined call.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// Re-deliver up to `count` entries that were read by `group` but have
    /// stayed unacknowledged for at least `min_idle`, transferring them to
    /// `consumer`. Reclaimed entries stay pending until acked.
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>>;

    /// Enforce the retention policy on `stream`.
    async fn trim(&self, stream: &str, retention: Retention) -> Result<u64>;

    /// Number of entries currently in `stream`.
    async fn stream_len(&self, stream: &str) -> Result<u64>;

    /// Streams whose key starts with `prefix`.
    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove `stream` and all its groups.
    async fn delete_stream(&self, stream: &str) -> Result<()>;

    /// Write a side record (dead letters) under `key` with a TTL.
    async fn put_record(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Read a side record, `None` if absent or expired.
    async fn get_record(&self, key: &str) -> Result<Option<String>>;

    /// Keys of live side records starting with `prefix`.
    async fn list_records(&self, prefix: &str) -> Result<Vec<String>>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Initialize a stream store from configuration.
///
/// A `redis://` URL selects the Redis backend (requires the `redis`
/// feature); `memory://` selects the in-process store.
pub async fn init_store(config: &StoreConfig) -> Result<Arc<dyn StreamStore>> {
    if config.url.starts_with("memory://") {
        info!(store = "memory", "Stream store initialized");
        return Ok(Arc::new(MemoryStreamStore::new()));
    }

    #[cfg(feature = "redis")]
    {
        let store = RedisStreamStore::connect(config).await?;
        info!(store = "redis", url = %config.url, "Stream store initialized");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    Err(crate::BusError::Config(format!(
        "store url '{}' requires the 'redis' feature",
        config.url
    )))
}

/// Timestamp in stream-id form (`{millis}-{seq}`) for an entry id.
pub fn entry_timestamp(id: &EntryId) -> Option<DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}
