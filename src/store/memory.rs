//! In-memory stream store for tests and single-process deployments.
//!
//! Implements real consumer-group semantics: a per-group cursor claimed
//! under one lock gives load-balanced delivery within a group, while each
//! group progresses independently over the full entry sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{EntryId, Retention, StartFrom, StoredEntry, StreamStore, WireEntry};
use crate::Result;

#[derive(Debug)]
struct MemEntry {
    id: EntryId,
    millis: i64,
    entry: WireEntry,
}

#[derive(Debug, Clone, Copy)]
struct PendingDelivery {
    offset: u64,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct MemGroup {
    /// Absolute offset of the next undelivered entry.
    cursor: u64,
    /// Delivered but unacknowledged entries.
    pending: HashMap<EntryId, PendingDelivery>,
}

#[derive(Debug, Default)]
struct MemStream {
    /// Absolute offset of `entries[0]`; grows as the stream is trimmed.
    base_offset: u64,
    entries: VecDeque<MemEntry>,
    last_millis: i64,
    next_seq: u64,
    groups: HashMap<String, MemGroup>,
}

impl MemStream {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.entries.len() as u64
    }

    fn next_id(&mut self, millis: i64) -> EntryId {
        if millis == self.last_millis {
            self.next_seq += 1;
        } else {
            self.last_millis = millis;
            self.next_seq = 0;
        }
        format!("{}-{}", millis, self.next_seq)
    }
}

#[derive(Debug)]
struct Record {
    value: String,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, MemStream>,
    records: HashMap<String, Record>,
}

/// In-process stream store.
#[derive(Clone, Default)]
pub struct MemoryStreamStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim up to `count` entries for `group`, advancing its cursor.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        let mut inner = self.inner.lock().await;
        let mem = match inner.streams.get_mut(stream) {
            Some(mem) => mem,
            None => return Ok(Vec::new()),
        };
        let base = mem.base_offset;
        let end = mem.end_offset();
        let MemStream { entries, groups, .. } = mem;
        let grp = groups
            .get_mut(group)
            .ok_or_else(|| crate::BusError::Transport(format!("no group '{group}' on '{stream}'")))?;

        let mut out = Vec::new();
        let mut offset = grp.cursor.max(base);
        while offset < end && out.len() < count {
            let entry = &entries[(offset - base) as usize];
            grp.pending.insert(
                entry.id.clone(),
                PendingDelivery {
                    offset,
                    delivered_at: Instant::now(),
                },
            );
            out.push(StoredEntry {
                id: entry.id.clone(),
                entry: entry.entry.clone(),
            });
            offset += 1;
        }
        grp.cursor = offset;
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, stream: &str, entry: WireEntry) -> Result<EntryId> {
        let mut inner = self.inner.lock().await;
        let mem = inner.streams.entry(stream.to_string()).or_default();
        let id = mem.next_id(Utc::now().timestamp_millis());
        mem.entries.push_back(MemEntry {
            id: id.clone(),
            millis: mem.last_millis,
            entry,
        });
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mem = inner.streams.entry(stream.to_string()).or_default();
        if mem.groups.contains_key(group) {
            return Ok(());
        }
        let cursor = match start {
            StartFrom::Beginning => mem.base_offset,
            StartFrom::Latest => mem.end_offset(),
            StartFrom::Timestamp(millis) => mem
                .entries
                .iter()
                .position(|e| e.millis >= millis)
                .map(|i| mem.base_offset + i as u64)
                .unwrap_or_else(|| mem.end_offset()),
        };
        debug!(stream = %stream, group = %group, cursor, "Consumer group created");
        mem.groups.insert(
            group.to_string(),
            MemGroup {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoredEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let claimed = self.claim(stream, group, count).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
            if block.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mem = match inner.streams.get_mut(stream) {
            Some(mem) => mem,
            None => return Ok(0),
        };
        let grp = match mem.groups.get_mut(group) {
            Some(grp) => grp,
            None => return Ok(0),
        };
        let mut acked = 0;
        for id in ids {
            if grp.pending.remove(id).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mem = match inner.streams.get_mut(stream) {
            Some(mem) => mem,
            None => return Ok(Vec::new()),
        };
        let base = mem.base_offset;
        let MemStream { entries, groups, .. } = mem;
        let grp = match groups.get_mut(group) {
            Some(grp) => grp,
            None => return Ok(Vec::new()),
        };

        let mut stale: Vec<(u64, EntryId)> = grp
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, p)| (p.offset, id.clone()))
            .collect();
        stale.sort_unstable_by_key(|(offset, _)| *offset);
        stale.truncate(count);

        let mut out = Vec::new();
        for (offset, id) in stale {
            if offset < base {
                // Trimmed out from under the group; the claim is gone.
                grp.pending.remove(&id);
                continue;
            }
            if let Some(p) = grp.pending.get_mut(&id) {
                p.delivered_at = now;
            }
            let entry = &entries[(offset - base) as usize];
            out.push(StoredEntry {
                id,
                entry: entry.entry.clone(),
            });
        }
        Ok(out)
    }

    async fn trim(&self, stream: &str, retention: Retention) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mem = match inner.streams.get_mut(stream) {
            Some(mem) => mem,
            None => return Ok(0),
        };
        let mut removed = 0;
        let (max_len, max_age) = match retention {
            Retention::MaxLen(n) => (Some(n), None),
            Retention::MaxAge(age) => (None, Some(age)),
            Retention::Both { max_len, max_age } => (Some(max_len), Some(max_age)),
        };
        if let Some(age) = max_age {
            let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
            while mem.entries.front().is_some_and(|e| e.millis < cutoff) {
                mem.entries.pop_front();
                mem.base_offset += 1;
                removed += 1;
            }
        }
        if let Some(n) = max_len {
            while mem.entries.len() as u64 > n {
                mem.entries.pop_front();
                mem.base_offset += 1;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|m| m.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn list_streams(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.streams.remove(stream);
        Ok(())
    }

    async fn put_record(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.records.insert(
            key.to_string(),
            Record {
                value,
                expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
            },
        );
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get(key) {
            if record.expires_at <= Utc::now() {
                inner.records.remove(key);
                return Ok(None);
            }
            return Ok(Some(record.value.clone()));
        }
        Ok(None)
    }

    async fn list_records(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.records.retain(|_, r| r.expires_at > now);
        Ok(inner
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: &str) -> WireEntry {
        WireEntry {
            payload: payload.to_string(),
            priority: "normal".to_string(),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let store = MemoryStreamStore::new();
        let a = store.append("s", entry("a")).await.unwrap();
        let b = store.append("s", entry("b")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.stream_len("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_groups_progress_independently() {
        let store = MemoryStreamStore::new();
        store.append("s", entry("a")).await.unwrap();
        store.append("s", entry("b")).await.unwrap();
        store.ensure_group("s", "g1", StartFrom::Beginning).await.unwrap();
        store.ensure_group("s", "g2", StartFrom::Beginning).await.unwrap();

        let g1 = store
            .read_group("s", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let g2 = store
            .read_group("s", "g2", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(g1.len(), 2);
        assert_eq!(g2.len(), 2);
        assert_eq!(g1[0].entry.payload, "a");
        assert_eq!(g2[0].entry.payload, "a");
    }

    #[tokio::test]
    async fn test_load_balanced_within_group() {
        let store = MemoryStreamStore::new();
        for i in 0..4 {
            store.append("s", entry(&format!("m{i}"))).await.unwrap();
        }
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();

        let c1 = store
            .read_group("s", "g", "c1", 2, Duration::ZERO)
            .await
            .unwrap();
        let c2 = store
            .read_group("s", "g", "c2", 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(c1.len(), 2);
        assert_eq!(c2.len(), 2);
        // Disjoint, in append order across the two claims.
        assert_eq!(c1[0].entry.payload, "m0");
        assert_eq!(c2[0].entry.payload, "m2");
    }

    #[tokio::test]
    async fn test_latest_group_skips_history() {
        let store = MemoryStreamStore::new();
        store.append("s", entry("old")).await.unwrap();
        store.ensure_group("s", "g", StartFrom::Latest).await.unwrap();
        store.append("s", entry("new")).await.unwrap();

        let read = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].entry.payload, "new");
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = MemoryStreamStore::new();
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();

        let reader = store.clone();
        let task = tokio::spawn(async move {
            reader
                .read_group("s", "g", "c", 1, Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", entry("late")).await.unwrap();

        let read = task.await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].entry.payload, "late");
    }

    #[tokio::test]
    async fn test_ack_removes_pending() {
        let store = MemoryStreamStore::new();
        store.append("s", entry("a")).await.unwrap();
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();
        let read = store
            .read_group("s", "g", "c", 1, Duration::ZERO)
            .await
            .unwrap();
        let acked = store.ack("s", "g", &[read[0].id.clone()]).await.unwrap();
        assert_eq!(acked, 1);
        // Second ack of the same id is a no-op.
        let acked = store.ack("s", "g", &[read[0].id.clone()]).await.unwrap();
        assert_eq!(acked, 0);
    }

    #[tokio::test]
    async fn test_claim_pending_redelivers_unacked() {
        let store = MemoryStreamStore::new();
        store.append("s", entry("a")).await.unwrap();
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();
        let read = store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        // Not yet idle long enough.
        let reclaimed = store
            .claim_pending("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = store
            .claim_pending("s", "g", "c2", Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, read[0].id);
        assert_eq!(reclaimed[0].entry.payload, "a");

        // The reclaim refreshed the delivery time.
        let again = store
            .claim_pending("s", "g", "c2", Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_acked_entries_are_not_reclaimed() {
        let store = MemoryStreamStore::new();
        store.append("s", entry("a")).await.unwrap();
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();
        let read = store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        store.ack("s", "g", &[read[0].id.clone()]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = store
            .claim_pending("s", "g", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_trim_max_len() {
        let store = MemoryStreamStore::new();
        for i in 0..5 {
            store.append("s", entry(&format!("m{i}"))).await.unwrap();
        }
        let removed = store.trim("s", Retention::MaxLen(2)).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.stream_len("s").await.unwrap(), 2);

        // A fresh group bound at Beginning only sees retained entries.
        store.ensure_group("s", "g", StartFrom::Beginning).await.unwrap();
        let read = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].entry.payload, "m3");
    }

    #[tokio::test]
    async fn test_records_expire() {
        let store = MemoryStreamStore::new();
        store
            .put_record("dlq:1", "{}".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put_record("dlq:2", "{}".to_string(), Duration::ZERO)
            .await
            .unwrap();

        assert!(store.get_record("dlq:1").await.unwrap().is_some());
        assert!(store.get_record("dlq:2").await.unwrap().is_none());
        let keys = store.list_records("dlq:").await.unwrap();
        assert_eq!(keys, vec!["dlq:1".to_string()]);
    }
}
