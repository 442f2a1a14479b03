//! Redis stream store integration tests.
//!
//! Run with: cargo test --test store_redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::time::Duration;

use stratus::config::StoreConfig;
use stratus::store::{RedisStreamStore, Retention, StartFrom, StreamStore, WireEntry};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

async fn connect() -> RedisStreamStore {
    let config = StoreConfig {
        url: redis_uri(),
        ..Default::default()
    };
    RedisStreamStore::connect(&config)
        .await
        .expect("Failed to connect to Redis")
}

fn entry(payload: &str) -> WireEntry {
    WireEntry {
        payload: payload.to_string(),
        priority: "normal".to_string(),
        source: "test".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_append_read_ack_cycle() {
    let store = connect().await;
    let stream = format!("{}:streams:orders", test_prefix());

    store
        .ensure_group(&stream, "workers", StartFrom::Beginning)
        .await
        .unwrap();
    let first = store.append(&stream, entry("{\"n\":1}")).await.unwrap();
    let second = store.append(&stream, entry("{\"n\":2}")).await.unwrap();
    assert!(second > first);

    let batch = store
        .read_group(&stream, "workers", "c1", 10, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, first);
    assert_eq!(batch[0].entry.payload, "{\"n\":1}");

    let acked = store
        .ack(&stream, "workers", &[first.clone(), second.clone()])
        .await
        .unwrap();
    assert_eq!(acked, 2);

    // Nothing new remains for this group.
    let empty = store
        .read_group(&stream, "workers", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_empty());

    store.delete_stream(&stream).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_ensure_group_is_idempotent() {
    let store = connect().await;
    let stream = format!("{}:streams:orders", test_prefix());

    store
        .ensure_group(&stream, "workers", StartFrom::Beginning)
        .await
        .unwrap();
    // Second creation hits BUSYGROUP and must still succeed.
    store
        .ensure_group(&stream, "workers", StartFrom::Latest)
        .await
        .unwrap();

    store.delete_stream(&stream).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_groups_read_independently() {
    let store = connect().await;
    let stream = format!("{}:streams:orders", test_prefix());

    store
        .ensure_group(&stream, "audit", StartFrom::Beginning)
        .await
        .unwrap();
    store
        .ensure_group(&stream, "billing", StartFrom::Beginning)
        .await
        .unwrap();
    store.append(&stream, entry("{}")).await.unwrap();

    for group in ["audit", "billing"] {
        let batch = store
            .read_group(&stream, group, "c1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1, "group {group} should see the entry");
    }

    store.delete_stream(&stream).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_claim_pending_transfers_stale_entries() {
    let store = connect().await;
    let stream = format!("{}:streams:orders", test_prefix());

    store
        .ensure_group(&stream, "workers", StartFrom::Beginning)
        .await
        .unwrap();
    let id = store.append(&stream, entry("{\"n\":1}")).await.unwrap();
    let read = store
        .read_group(&stream, "workers", "c1", 10, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(read.len(), 1);

    // Unacknowledged by c1; after the idle bound another consumer may
    // claim it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = store
        .claim_pending(&stream, "workers", "c2", Duration::from_millis(50), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);
    assert_eq!(reclaimed[0].entry.payload, "{\"n\":1}");

    store.ack(&stream, "workers", &[id]).await.unwrap();
    let empty = store
        .claim_pending(&stream, "workers", "c2", Duration::ZERO, 10)
        .await
        .unwrap();
    assert!(empty.is_empty());

    store.delete_stream(&stream).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_trim_to_max_len() {
    let store = connect().await;
    let stream = format!("{}:streams:orders", test_prefix());

    for n in 0..20 {
        store
            .append(&stream, entry(&format!("{{\"n\":{n}}}")))
            .await
            .unwrap();
    }
    store.trim(&stream, Retention::MaxLen(5)).await.unwrap();
    // MAXLEN trimming is approximate; it must never grow the stream.
    assert!(store.stream_len(&stream).await.unwrap() <= 20);

    store.delete_stream(&stream).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_records_roundtrip_with_ttl() {
    let store = connect().await;
    let prefix = test_prefix();
    let key = format!("{}:dlq:1700000000000:abc", prefix);

    store
        .put_record(&key, "{\"error\":\"boom\"}".to_string(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        store.get_record(&key).await.unwrap().as_deref(),
        Some("{\"error\":\"boom\"}")
    );
    let keys = store.list_records(&format!("{}:dlq:", prefix)).await.unwrap();
    assert_eq!(keys, vec![key.clone()]);

    assert!(store.get_record("missing:key").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_list_streams_by_prefix() {
    let store = connect().await;
    let prefix = test_prefix();
    let a = format!("{}:streams:a", prefix);
    let b = format!("{}:streams:b", prefix);

    store.append(&a, entry("{}")).await.unwrap();
    store.append(&b, entry("{}")).await.unwrap();

    let mut streams = store
        .list_streams(&format!("{}:streams:", prefix))
        .await
        .unwrap();
    streams.sort();
    assert_eq!(streams, vec![a.clone(), b.clone()]);

    store.delete_stream(&a).await.unwrap();
    store.delete_stream(&b).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_ping() {
    let store = connect().await;
    store.ping().await.unwrap();
}
