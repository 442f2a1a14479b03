//! Broker Core.
//!
//! Publish/subscribe over the stream store: per-event-type stream naming,
//! batched consumer-group dispatch, retry scheduling, dead-letter routing,
//! and the health/status surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_STREAM_MAX_LEN};
use crate::dlq::DeadLetterStore;
use crate::envelope::{EventEnvelope, Priority, RetryPolicy};
use crate::lifecycle::{self, LifecycleEvent};
use crate::store::{Retention, StartFrom, StreamStore};
use crate::{BusError, Result};

mod subscription;

pub use subscription::{SubscribeOptions, SubscriptionHandle};

/// Stream key for an event type: `{prefix}:streams:{event_type}`.
pub fn stream_key(prefix: &str, event_type: &str) -> String {
    format!("{}:streams:{}", prefix, event_type)
}

/// Retry stream paired with a primary stream: `{primary}:retry`.
pub fn retry_stream_key(primary: &str) -> String {
    format!("{}:retry", primary)
}

/// Handler for events delivered to a subscription.
///
/// The envelope is wrapped in `Arc` to enforce immutability during
/// distribution. A returned error routes the message into the retry path;
/// it never propagates into the consumer loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<EventEnvelope>) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Arc<EventEnvelope>) -> Result<()> {
        (self.0)(event).await
    }
}

/// Convenience constructor for closure handlers.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Publish-time options. Unset fields fall back to configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub source: Option<String>,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<Priority>,
    pub ttl_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub tags: Vec<String>,
}

/// Per-stream provisioning: retention and optional partitioning hint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_len: Option<u64>,
    pub max_age_secs: Option<u64>,
    /// Partitioning hint for stores that shard streams. Advisory only.
    pub partitions: Option<u32>,
}

impl StreamConfig {
    fn retention(&self) -> Retention {
        match (self.max_len, self.max_age_secs) {
            (Some(len), Some(age)) => Retention::Both {
                max_len: len,
                max_age: Duration::from_secs(age),
            },
            (None, Some(age)) => Retention::MaxAge(Duration::from_secs(age)),
            (Some(len), None) => Retention::MaxLen(len),
            (None, None) => Retention::MaxLen(DEFAULT_STREAM_MAX_LEN),
        }
    }

    fn compatible_with(&self, other: &StreamConfig) -> bool {
        self.max_len == other.max_len && self.max_age_secs == other.max_age_secs
    }
}

/// Overall broker health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot of the broker's health/status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BrokerStatus {
    pub overall: HealthState,
    pub store_connected: bool,
    pub active_subscriptions: usize,
    pub active_streams: usize,
    pub events_published: u64,
    pub events_consumed: u64,
    pub events_failed: u64,
    pub events_dead_lettered: u64,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerCounters {
    pub published: AtomicU64,
    pub consumed: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub store_errors: AtomicU64,
}

struct SubscriptionEntry {
    handle: SubscriptionHandle,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// The publish/subscribe broker.
///
/// The subscription registry and per-stream configs are owned here and
/// exposed only through methods; the store's consumer-group primitive is
/// the only delivery-path synchronization.
pub struct Broker {
    store: Arc<dyn StreamStore>,
    config: Config,
    subscriptions: RwLock<HashMap<Uuid, SubscriptionEntry>>,
    stream_configs: RwLock<HashMap<String, StreamConfig>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    counters: Arc<BrokerCounters>,
    dead_letters: DeadLetterStore,
    store_errors_at_last_check: AtomicU64,
    shutting_down: AtomicBool,
}

impl Broker {
    /// Create a broker over an already-connected store.
    pub fn new(store: Arc<dyn StreamStore>, config: Config) -> Self {
        let (lifecycle_tx, _) = lifecycle::channel();
        let dead_letters = DeadLetterStore::new(
            Arc::clone(&store),
            &config.dead_letter.key_prefix,
            config.dead_letter.retention_seconds,
        );
        Self {
            store,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            stream_configs: RwLock::new(HashMap::new()),
            lifecycle_tx,
            counters: Arc::new(BrokerCounters::default()),
            dead_letters,
            store_errors_at_last_check: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Connect the configured store and build a broker on top of it.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let store = crate::store::init_store(&config.store).await?;
        Ok(Arc::new(Self::new(store, config)))
    }

    /// Observe broker lifecycle signals.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// The dead-letter store for inspection and tooling.
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine; observers come and go.
        let _ = self.lifecycle_tx.send(event);
    }

    /// Announce a configuration change to lifecycle observers.
    pub fn notify_config_changed(&self, detail: impl Into<String>) {
        self.emit(LifecycleEvent::ConfigChanged {
            detail: detail.into(),
        });
    }

    /// Publish a payload as a new envelope on `event_type`'s stream.
    ///
    /// Returns the assigned event id. Store failures surface immediately
    /// as `Transport` errors; append is atomic, so a failure wrote
    /// nothing.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<Uuid> {
        let mut envelope = EventEnvelope::new(
            event_type,
            options.source.unwrap_or_else(|| "stratus".to_string()),
            payload,
        );
        envelope.target = options.target;
        envelope.correlation_id = options.correlation_id;
        envelope.priority = options.priority.unwrap_or(self.config.defaults.priority);
        envelope.ttl_seconds = options.ttl_seconds.or(self.config.defaults.ttl_seconds);
        envelope.retry_policy = options.retry_policy;
        envelope.tags = options.tags;
        self.publish_envelope(envelope).await
    }

    /// Publish a fully built envelope (cross-tenant path).
    pub async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<Uuid> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        let stream = stream_key(&self.config.store.key_prefix, &envelope.event_type);
        let wire = crate::store::WireEntry {
            payload: serde_json::to_string(&envelope)?,
            priority: envelope.priority.as_str().to_string(),
            source: envelope.source.clone(),
        };

        self.store.append(&stream, wire).await?;

        let retention = {
            let configs = self.stream_configs.read().await;
            configs
                .get(&envelope.event_type)
                .cloned()
                .unwrap_or_default()
                .retention()
        };
        if let Err(e) = self.store.trim(&stream, retention).await {
            // Retention is best-effort on the publish path; the next
            // publish will trim again.
            warn!(stream = %stream, error = %e, "Stream trim failed");
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.emit(LifecycleEvent::Published {
            id: envelope.id,
            event_type: envelope.event_type.clone(),
            timestamp: envelope.timestamp,
        });
        Ok(envelope.id)
    }

    /// Provision a stream's retention ahead of first publish. Idempotent
    /// when the existing config is compatible.
    pub async fn create_stream(&self, event_type: &str, config: StreamConfig) -> Result<()> {
        let mut configs = self.stream_configs.write().await;
        if let Some(existing) = configs.get(event_type) {
            if !existing.compatible_with(&config) {
                return Err(BusError::Validation(format!(
                    "stream '{}' already provisioned with different retention",
                    event_type
                )));
            }
            return Ok(());
        }
        let stream = stream_key(&self.config.store.key_prefix, event_type);
        self.store.trim(&stream, config.retention()).await?;
        configs.insert(event_type.to_string(), config);
        info!(event_type = %event_type, "Stream provisioned");
        Ok(())
    }

    /// Subscribe `handler` to `event_type` within `group`.
    ///
    /// Idempotent per (event type, group): a second call returns the
    /// existing handle. Creates the consumer group at `options.start_from`
    /// if absent and starts the background read loops (primary stream and
    /// its paired retry stream).
    pub async fn subscribe(
        &self,
        event_type: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        let mut subs = self.subscriptions.write().await;
        if let Some(existing) = subs
            .values()
            .find(|e| e.handle.event_type == event_type && e.handle.group == group)
        {
            return Ok(existing.handle.clone());
        }

        let primary = stream_key(&self.config.store.key_prefix, event_type);
        let retry = retry_stream_key(&primary);
        self.store
            .ensure_group(&primary, group, options.start_from)
            .await?;
        // Retries are new deliveries; the retry stream group always reads
        // from its beginning.
        self.store
            .ensure_group(&retry, group, StartFrom::Beginning)
            .await?;

        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            group: group.to_string(),
        };

        let retry_retention = {
            let configs = self.stream_configs.read().await;
            configs
                .get(event_type)
                .cloned()
                .unwrap_or_default()
                .retention()
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = subscription::SubscriptionContext {
            store: Arc::clone(&self.store),
            lifecycle_tx: self.lifecycle_tx.clone(),
            counters: Arc::clone(&self.counters),
            dead_letters: self.dead_letters.clone(),
            dead_letter_enabled: self.config.dead_letter.enabled,
            default_retry: self.config.defaults.retry.clone(),
            event_type: event_type.to_string(),
            group: group.to_string(),
            batch_size: options
                .batch_size
                .unwrap_or(self.config.performance.batch_size),
            block: Duration::from_millis(
                options
                    .block_timeout_ms
                    .unwrap_or(self.config.performance.batch_timeout_ms),
            ),
            reclaim_interval: Duration::from_millis(self.config.performance.reclaim_interval_ms),
            reclaim_min_idle: Duration::from_millis(self.config.performance.reclaim_min_idle_ms),
            retry_retention,
            handler,
        };

        let consumer = options
            .consumer_name
            .unwrap_or_else(|| format!("{}-{}", group, &handle.id.simple().to_string()[..8]));

        let tasks = vec![
            tokio::spawn(subscription::run_loop(
                ctx.clone(),
                primary.clone(),
                retry.clone(),
                format!("{consumer}-p"),
                false,
                stop_rx.clone(),
            )),
            tokio::spawn(subscription::run_loop(
                ctx,
                retry.clone(),
                retry,
                format!("{consumer}-r"),
                true,
                stop_rx,
            )),
        ];

        info!(
            event_type = %event_type,
            group = %group,
            subscription = %handle.id,
            "Subscription started"
        );
        subs.insert(
            handle.id,
            SubscriptionEntry {
                handle: handle.clone(),
                stop_tx,
                tasks,
            },
        );
        Ok(handle)
    }

    /// Stop a subscription. No new reads are issued; in-flight handler
    /// invocations run to completion before the loops exit.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let entry = {
            let mut subs = self.subscriptions.write().await;
            subs.remove(&handle.id)
                .ok_or_else(|| BusError::SubscriptionNotFound(handle.id.to_string()))?
        };
        let _ = entry.stop_tx.send(true);
        for task in entry.tasks {
            let _ = task.await;
        }
        info!(subscription = %handle.id, "Subscription stopped");
        Ok(())
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Total backlog across all primary and retry streams.
    pub async fn queue_depth(&self) -> Result<u64> {
        let prefix = format!("{}:streams:", self.config.store.key_prefix);
        let mut depth = 0;
        for stream in self.store.list_streams(&prefix).await? {
            depth += self.store.stream_len(&stream).await?;
        }
        Ok(depth)
    }

    /// Health/status surface.
    ///
    /// Unhealthy when the store is unreachable; degraded when store errors
    /// occurred since the previous check.
    pub async fn status(&self) -> BrokerStatus {
        let store_connected = self.store.ping().await.is_ok();
        let prefix = format!("{}:streams:", self.config.store.key_prefix);
        let active_streams = self
            .store
            .list_streams(&prefix)
            .await
            .map(|s| s.len())
            .unwrap_or(0);

        let store_errors = self.counters.store_errors.load(Ordering::Relaxed);
        let errors_since_last = store_errors
            .saturating_sub(self.store_errors_at_last_check.swap(store_errors, Ordering::Relaxed));

        let overall = if !store_connected {
            HealthState::Unhealthy
        } else if errors_since_last > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        BrokerStatus {
            overall,
            store_connected,
            active_subscriptions: self.subscriptions.read().await.len(),
            active_streams,
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_consumed: self.counters.consumed.load(Ordering::Relaxed),
            events_failed: self.counters.failed.load(Ordering::Relaxed),
            events_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            last_check: Utc::now(),
        }
    }

    /// Broadcast the shutdown signal, stop all subscriptions, and let
    /// observers flush before store connections drop. Publishes and new
    /// subscriptions are rejected from this point on.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.emit(LifecycleEvent::Shutdown);

        let entries: Vec<SubscriptionEntry> = {
            let mut subs = self.subscriptions.write().await;
            subs.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let _ = entry.stop_tx.send(true);
            for task in entry.tasks {
                let _ = task.await;
            }
        }
        info!("Broker shut down");
        Ok(())
    }
}
