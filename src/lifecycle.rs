//! Broker lifecycle signals.
//!
//! A closed, tagged-variant taxonomy broadcast over a tokio channel.
//! Observers (monitoring, the registry bridge) subscribe here instead of
//! calling into the broker; string-keyed event names exist only at the
//! wire-serialization boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the lifecycle broadcast channel.
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 4096;

/// Everything the broker reports about its own operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// An envelope was appended to its stream.
    Published {
        id: Uuid,
        event_type: String,
        timestamp: DateTime<Utc>,
    },
    /// A handler in `group` processed the envelope successfully.
    Consumed {
        id: Uuid,
        event_type: String,
        group: String,
        timestamp: DateTime<Utc>,
    },
    /// A handler in `group` failed; the message enters the retry path.
    HandlerFailed {
        id: Uuid,
        event_type: String,
        group: String,
        error: String,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A redelivery was scheduled onto the retry stream.
    RetryScheduled {
        id: Uuid,
        event_type: String,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The retry budget was exhausted and the message was dead-lettered.
    DeadLettered {
        id: Uuid,
        event_type: String,
        error: String,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// The store was unreachable; the affected loop is reconnecting.
    StoreError {
        context: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// System configuration changed (e.g. a service registered).
    ConfigChanged { detail: String },
    /// Broadcast before store connections close, so observers can flush.
    Shutdown,
}

impl LifecycleEvent {
    /// Stable wire name for the variant, used at serialization boundaries
    /// and as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Published { .. } => "published",
            LifecycleEvent::Consumed { .. } => "consumed",
            LifecycleEvent::HandlerFailed { .. } => "handler_failed",
            LifecycleEvent::RetryScheduled { .. } => "retry_scheduled",
            LifecycleEvent::DeadLettered { .. } => "dead_lettered",
            LifecycleEvent::StoreError { .. } => "store_error",
            LifecycleEvent::ConfigChanged { .. } => "config_changed",
            LifecycleEvent::Shutdown => "shutdown",
        }
    }
}

/// Create the lifecycle broadcast pair.
pub fn channel() -> (
    broadcast::Sender<LifecycleEvent>,
    broadcast::Receiver<LifecycleEvent>,
) {
    broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_observers() {
        let (tx, mut rx_a) = channel();
        let mut rx_b = tx.subscribe();

        tx.send(LifecycleEvent::Shutdown).unwrap();

        assert!(matches!(rx_a.recv().await.unwrap(), LifecycleEvent::Shutdown));
        assert!(matches!(rx_b.recv().await.unwrap(), LifecycleEvent::Shutdown));
    }

    #[test]
    fn test_kind_labels() {
        let event = LifecycleEvent::Published {
            id: Uuid::new_v4(),
            event_type: "a.b".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.kind(), "published");
        assert_eq!(LifecycleEvent::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn test_wire_serialization_is_tagged() {
        let event = LifecycleEvent::ConfigChanged {
            detail: "service registered".to_string(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["kind"], "config_changed");
    }
}
