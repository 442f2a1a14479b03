//! Redis Streams store implementation.
//!
//! Streams map directly onto Redis Streams: XADD for append, XREADGROUP
//! for consumer-group reads, XACK for batched acknowledgement, XTRIM for
//! retention. Dead-letter records are plain keys with an EX TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{aio::ConnectionManager, AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo};
use tracing::{debug, info, warn};

use super::{EntryId, Retention, StartFrom, StoredEntry, StreamStore, WireEntry};
use crate::config::StoreConfig;
use crate::Result;

/// Redis-backed stream store.
pub struct RedisStreamStore {
    conn: ConnectionManager,
}

impl RedisStreamStore {
    /// Connect to Redis, retrying with exponential backoff.
    ///
    /// Transport errors here are retried at the connection layer; the
    /// caller only sees a failure once the retry budget is exhausted.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        if !config.cluster_nodes.is_empty() {
            warn!(
                nodes = config.cluster_nodes.len(),
                "Cluster topology configured but not supported by this backend; using the primary url only"
            );
        }
        let client = Client::open(connection_info(config)?)?;

        let conn = (|| {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5))
                .with_max_times(5),
        )
        .notify(|err: &redis::RedisError, dur: Duration| {
            warn!(error = %err, retry_in = ?dur, "Redis connection failed, retrying");
        })
        .await?;

        info!(url = %config.url, "Connected to Redis");
        Ok(Self { conn })
    }

    fn parse_reply(reply: StreamReadReply) -> Vec<StoredEntry> {
        reply
            .keys
            .into_iter()
            .flat_map(|key| Self::parse_ids(key.ids))
            .collect()
    }

    fn parse_ids(ids: Vec<StreamId>) -> Vec<StoredEntry> {
        let mut out = Vec::new();
        for sid in ids {
            let mut fields: HashMap<String, String> = HashMap::new();
            for (name, value) in &sid.map {
                if let Ok(s) = redis::from_redis_value::<String>(value) {
                    fields.insert(name.clone(), s);
                }
            }
            // Malformed entries still flow through, so the consumer can
            // dead-letter and acknowledge them instead of leaving them
            // pending forever.
            let entry = WireEntry::from_fields(&fields).unwrap_or_else(|| {
                warn!(id = %sid.id, "Stream entry missing payload field");
                WireEntry {
                    payload: String::new(),
                    priority: "normal".to_string(),
                    source: String::new(),
                }
            });
            out.push(StoredEntry { id: sid.id, entry });
        }
        out
    }
}

/// Connection parameters from the store config: the url, with explicitly
/// configured credentials overriding any embedded in it.
fn connection_info(config: &StoreConfig) -> Result<ConnectionInfo> {
    let mut info = config.url.as_str().into_connection_info()?;
    if let Some(username) = &config.username {
        info.redis.username = Some(username.clone());
    }
    if let Some(password) = &config.password {
        info.redis.password = Some(password.clone());
    }
    Ok(info)
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(&self, stream: &str, entry: WireEntry) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &entry.fields()).await?;
        debug!(stream = %stream, id = %id, "Appended entry");
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(stream, group, &start.as_cursor())
            .await;
        match result {
            Ok(_) => {
                debug!(stream = %stream, group = %group, "Consumer group created");
                Ok(())
            }
            // Group already exists: idempotent success.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoredEntry>> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;
        Ok(Self::parse_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;
        let ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as u128 >= min_idle.as_millis())
            .map(|p| p.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, &ids)
            .await?;
        Ok(Self::parse_ids(claimed.ids))
    }

    async fn trim(&self, stream: &str, retention: Retention) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        let (max_len, max_age) = match retention {
            Retention::MaxLen(n) => (Some(n), None),
            Retention::MaxAge(age) => (None, Some(age)),
            Retention::Both { max_len, max_age } => (Some(max_len), Some(max_age)),
        };
        if let Some(age) = max_age {
            let cutoff = chrono::Utc::now().timestamp_millis() - age.as_millis() as i64;
            let n: u64 = redis::cmd("XTRIM")
                .arg(stream)
                .arg("MINID")
                .arg("~")
                .arg(cutoff)
                .query_async(&mut conn)
                .await?;
            removed += n;
        }
        if let Some(n) = max_len {
            let trimmed: u64 = conn.xtrim(stream, StreamMaxlen::Approx(n as usize)).await?;
            removed += trimmed;
        }
        Ok(removed)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_records(prefix).await
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(stream).await?;
        Ok(())
    }

    async fn put_record(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn list_records(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        // SCAN for non-blocking iteration.
        let mut cursor = 0u64;
        let mut keys: Vec<String> = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_applies_credentials() {
        let config = StoreConfig {
            url: "redis://localhost:6379/0".to_string(),
            username: Some("app".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let info = connection_info(&config).unwrap();
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_connection_info_keeps_url_credentials_when_unset() {
        let config = StoreConfig {
            url: "redis://user:pw@localhost:6379".to_string(),
            ..Default::default()
        };
        let info = connection_info(&config).unwrap();
        assert_eq!(info.redis.username.as_deref(), Some("user"));
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
    }
}
