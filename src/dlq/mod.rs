//! Dead-letter store.
//!
//! Terminal storage for messages that exhausted their retry budget. Each
//! record keeps the full payload, the last error, and the retry history
//! count, and stays inspectable until its retention TTL expires.
//!
//! ## Key naming
//!
//! Records live at `{prefix}:{timestamp_millis}:{original_id}`; the
//! timestamp component makes records sortable by failure time, the id
//! component keeps concurrent failures from colliding.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::envelope::DeadLetterRecord;
use crate::store::StreamStore;
use crate::Result;

/// Handle to dead-letter records in the side store.
#[derive(Clone)]
pub struct DeadLetterStore {
    store: Arc<dyn StreamStore>,
    key_prefix: String,
    retention: Duration,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn StreamStore>, key_prefix: &str, retention_seconds: u64) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
            retention: Duration::from_secs(retention_seconds),
        }
    }

    /// Configured record TTL in seconds.
    pub fn retention_seconds(&self) -> u64 {
        self.retention.as_secs()
    }

    fn key_for(&self, record: &DeadLetterRecord) -> String {
        format!(
            "{}:{}:{}",
            self.key_prefix,
            record.dead_lettered_at.timestamp_millis(),
            record.original_id
        )
    }

    /// Persist a dead-letter record with the configured retention TTL.
    ///
    /// Returns the record key.
    pub async fn write(&self, record: &DeadLetterRecord) -> Result<String> {
        let key = self.key_for(record);
        let value = serde_json::to_string(record)?;
        self.store.put_record(&key, value, self.retention).await?;
        info!(
            key = %key,
            event_type = %record.event_type,
            retry_count = record.retry_count,
            error = %record.error,
            "Message dead-lettered"
        );
        Ok(key)
    }

    /// Keys of all live dead-letter records.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys = self
            .store
            .list_records(&format!("{}:", self.key_prefix))
            .await?;
        keys.sort();
        Ok(keys)
    }

    /// Fetch one record by key, `None` if absent or expired.
    pub async fn fetch(&self, key: &str) -> Result<Option<DeadLetterRecord>> {
        match self.store.get_record(key).await? {
            Some(value) => match serde_json::from_str(&value) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable dead-letter record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fetch every live record, oldest first.
    pub async fn fetch_all(&self) -> Result<Vec<DeadLetterRecord>> {
        let mut records = Vec::new();
        for key in self.list().await? {
            if let Some(record) = self.fetch(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::store::MemoryStreamStore;
    use chrono::Utc;
    use serde_json::json;

    fn make_record(error: &str) -> DeadLetterRecord {
        let envelope = EventEnvelope::new("invoice.created", "billing", json!({"amount": 42}));
        DeadLetterRecord {
            original_id: envelope.id,
            event_type: envelope.event_type.clone(),
            envelope,
            error: error.to_string(),
            retry_count: 3,
            dead_lettered_at: Utc::now(),
            retention_seconds: 3600,
        }
    }

    #[tokio::test]
    async fn test_write_and_fetch_roundtrip() {
        let store = Arc::new(MemoryStreamStore::new());
        let dlq = DeadLetterStore::new(store, "test:dlq", 3600);
        let record = make_record("handler exploded");

        let key = dlq.write(&record).await.unwrap();
        assert!(key.starts_with("test:dlq:"));

        let fetched = dlq.fetch(&key).await.unwrap().unwrap();
        assert_eq!(fetched.original_id, record.original_id);
        assert_eq!(fetched.error, "handler exploded");
        assert_eq!(fetched.retry_count, 3);
        assert_eq!(fetched.envelope.payload["amount"], 42);
    }

    #[tokio::test]
    async fn test_list_and_fetch_all() {
        let store = Arc::new(MemoryStreamStore::new());
        let dlq = DeadLetterStore::new(store, "test:dlq", 3600);

        for i in 0..3 {
            dlq.write(&make_record(&format!("err-{i}"))).await.unwrap();
        }

        assert_eq!(dlq.list().await.unwrap().len(), 3);
        assert_eq!(dlq.fetch_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_none() {
        let store = Arc::new(MemoryStreamStore::new());
        let dlq = DeadLetterStore::new(store, "test:dlq", 3600);
        assert!(dlq.fetch("test:dlq:0:nope").await.unwrap().is_none());
    }
}
