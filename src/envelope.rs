//! Event envelope and the record types derived from it.
//!
//! An envelope is immutable once published; its identity is `id`. The
//! retry envelope and dead-letter record wrap a full copy of the original
//! envelope so a failed message stays inspectable end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Delivery priority carried as a sidecar field on the stream entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(()),
        }
    }
}

/// Retry behavior for a published event.
///
/// Delay for attempt `n` is `initial_delay_ms * backoff_multiplier^n`,
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivery attempt `retry_count` (0-indexed).
    ///
    /// Non-decreasing in `retry_count` up to `max_delay_ms`.
    pub fn delay_for(&self, retry_count: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(retry_count.min(30) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        std::time::Duration::from_millis(ms as u64)
    }

    /// Whether another redelivery attempt is allowed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}

/// The unit of publication. Immutable once appended to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub version: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Construct a new envelope with a fresh id and current timestamp.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            target: None,
            timestamp: Utc::now(),
            correlation_id: None,
            version: "1.0".to_string(),
            priority: Priority::Normal,
            ttl_seconds: None,
            retry_policy: None,
            tags: Vec::new(),
            payload,
        }
    }

    /// The retry policy to apply to this envelope, falling back to `default`.
    pub fn effective_retry_policy(&self, default: &RetryPolicy) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_else(|| default.clone())
    }

    /// Whether the envelope's TTL has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now - self.timestamp > chrono::Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

/// A failed message waiting for redelivery on `<stream>:retry`.
///
/// References a full copy of the original envelope until the retry budget
/// is exhausted and the message moves to the dead-letter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub original_id: Uuid,
    pub retry_count: u32,
    pub last_error: String,
    pub next_attempt_at: DateTime<Utc>,
    pub envelope: EventEnvelope,
}

/// Terminal record for a message that exhausted its retry budget.
///
/// Inspectable (payload + error + retry history) until its retention TTL
/// expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_id: Uuid,
    pub event_type: String,
    pub envelope: EventEnvelope,
    pub error: String,
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub retention_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_ids_unique() {
        let a = EventEnvelope::new("invoice.created", "billing", json!({}));
        let b = EventEnvelope::new("invoice.created", "billing", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_envelope_roundtrip_keeps_type_field() {
        let env = EventEnvelope::new("invoice.created", "billing", json!({"amount": 42}));
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "invoice.created");
        let back: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.payload["amount"], 42);
    }

    #[test]
    fn test_retry_delay_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        };
        let mut last = std::time::Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last, "delay must be non-decreasing");
            assert!(delay.as_millis() <= 30_000);
            last = delay;
        }
        assert_eq!(policy.delay_for(0).as_millis(), 1000);
        assert_eq!(policy.delay_for(1).as_millis(), 2000);
        assert_eq!(policy.delay_for(10).as_millis(), 30_000);
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut env = EventEnvelope::new("a.b", "src", json!({}));
        env.ttl_seconds = Some(60);
        assert!(!env.is_expired(env.timestamp + chrono::Duration::seconds(59)));
        assert!(env.is_expired(env.timestamp + chrono::Duration::seconds(61)));
        env.ttl_seconds = None;
        assert!(!env.is_expired(env.timestamp + chrono::Duration::days(365)));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(Priority::Low.as_str(), "low");
        assert!("urgent".parse::<Priority>().is_err());
    }
}
