//! Trace-span bookkeeping.
//!
//! A configurable fraction of published events opens a span keyed by the
//! event id. Consumption closes the span and yields its duration;
//! handler failures append an error log entry and leave the span open.
//! Spans that never close are pruned after a maximum age.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Spans with no activity beyond this age are dropped on prune.
const MAX_SPAN_AGE_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A timed record of one event's processing lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    pub span_id: Uuid,
    pub trace_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    pub logs: Vec<SpanLog>,
}

pub struct TraceRegistry {
    sampling_rate: f64,
    spans: Mutex<HashMap<Uuid, TraceSpan>>,
}

impl TraceRegistry {
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            sampling_rate: sampling_rate.clamp(0.0, 1.0),
            spans: Mutex::new(HashMap::new()),
        }
    }

    /// Open a span for `event_id` if it falls in the sampled fraction.
    pub async fn maybe_open(&self, event_id: Uuid, event_type: &str, start: DateTime<Utc>) {
        if self.sampling_rate <= 0.0 {
            return;
        }
        if self.sampling_rate < 1.0 && rand::random::<f64>() >= self.sampling_rate {
            return;
        }
        let mut tags = BTreeMap::new();
        tags.insert("event.type".to_string(), event_type.to_string());
        let span = TraceSpan {
            span_id: Uuid::new_v4(),
            trace_id: event_id,
            parent_span_id: None,
            operation_name: format!("process {}", event_type),
            start_time: start,
            end_time: None,
            tags,
            logs: Vec::new(),
        };
        self.spans.lock().await.insert(event_id, span);
    }

    /// Close the span for `event_id`, returning its duration in
    /// milliseconds. `None` when the event was not sampled.
    pub async fn close(&self, event_id: Uuid, end: DateTime<Utc>) -> Option<f64> {
        let mut span = self.spans.lock().await.remove(&event_id)?;
        span.end_time = Some(end);
        let millis = end
            .signed_duration_since(span.start_time)
            .num_milliseconds()
            .max(0);
        Some(millis as f64)
    }

    /// Record a failure on the span without closing it; the retry path
    /// may still complete it.
    pub async fn log_error(&self, event_id: Uuid, error: &str) {
        if let Some(span) = self.spans.lock().await.get_mut(&event_id) {
            span.logs.push(SpanLog {
                timestamp: Utc::now(),
                message: format!("error: {}", error),
            });
        }
    }

    /// Drop spans that have been open longer than the maximum age.
    pub async fn prune(&self, now: DateTime<Utc>) {
        self.spans.lock().await.retain(|_, span| {
            now.signed_duration_since(span.start_time).num_seconds() <= MAX_SPAN_AGE_SECS
        });
    }

    pub async fn open_count(&self) -> usize {
        self.spans.lock().await.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_sampling_opens_and_closes() {
        let registry = TraceRegistry::new(1.0);
        let id = Uuid::new_v4();
        let start = Utc::now();
        registry.maybe_open(id, "invoice.created", start).await;
        assert_eq!(registry.open_count().await, 1);

        let duration = registry
            .close(id, start + chrono::Duration::milliseconds(250))
            .await;
        assert_eq!(duration, Some(250.0));
        assert_eq!(registry.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_sampling_opens_nothing() {
        let registry = TraceRegistry::new(0.0);
        registry.maybe_open(Uuid::new_v4(), "x", Utc::now()).await;
        assert_eq!(registry.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_keeps_span_open() {
        let registry = TraceRegistry::new(1.0);
        let id = Uuid::new_v4();
        registry.maybe_open(id, "invoice.created", Utc::now()).await;
        registry.log_error(id, "boom").await;
        assert_eq!(registry.open_count().await, 1);
        assert!(registry.close(id, Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn test_prune_drops_stale_spans() {
        let registry = TraceRegistry::new(1.0);
        let id = Uuid::new_v4();
        let long_ago = Utc::now() - chrono::Duration::seconds(MAX_SPAN_AGE_SECS + 1);
        registry.maybe_open(id, "invoice.created", long_ago).await;
        registry.prune(Utc::now()).await;
        assert_eq!(registry.open_count().await, 0);
    }
}
