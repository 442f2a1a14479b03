//! Monitoring & alerting.
//!
//! The monitor observes the broker purely through its lifecycle
//! broadcast plus the polled status surface. It maintains a bounded,
//! time-windowed metric store, evaluates alert thresholds every
//! collection cycle, and keeps trace spans for a sampled fraction of
//! events. All background work runs in explicitly started and stopped
//! tasks owned by the monitor.
//!
//! ## Derived metrics
//!
//! - `events_published_total` / `events_consumed_total` /
//!   `events_failed_total` / `events_dead_lettered_total` (cumulative)
//! - `error_rate`: failed / (consumed + failed) per collection cycle
//! - `throughput`: consumed events per second per collection cycle
//! - `avg_processing_latency_ms`: mean sampled span duration over the
//!   retention window
//! - `queue_depth`, `active_subscriptions`, `store_connected` (polled)
//! - `memory_bytes`: resident set size from `/proc/self/statm`

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::MonitoringConfig;
use crate::lifecycle::LifecycleEvent;

pub mod alerts;
pub mod export;
pub mod trace;

pub use alerts::{Alert, AlertManager, Severity};
pub use export::{DashboardSnapshot, EventTypeCount};
pub use trace::{SpanLog, TraceRegistry, TraceSpan};

/// One sample of a metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

/// Bounded, time-windowed store of metric samples, pruned on every
/// collection tick.
pub struct MetricStore {
    retention: Duration,
    series: HashMap<String, VecDeque<MetricPoint>>,
}

impl MetricStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            series: HashMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.record_at(name, value, BTreeMap::new(), Utc::now());
    }

    pub fn record_at(
        &mut self,
        name: &str,
        value: f64,
        labels: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    ) {
        self.series
            .entry(name.to_string())
            .or_default()
            .push_back(MetricPoint {
                timestamp,
                value,
                labels,
            });
    }

    pub fn latest(&self, name: &str) -> Option<&MetricPoint> {
        self.series.get(name)?.back()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn points_since(&self, name: &str, since: DateTime<Utc>) -> Vec<MetricPoint> {
        self.series
            .get(name)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn avg_since(&self, name: &str, since: DateTime<Utc>) -> Option<f64> {
        let points = self.points_since(name, since);
        if points.is_empty() {
            return None;
        }
        Some(points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64)
    }

    /// Drop samples older than the retention window; empty series are
    /// removed entirely.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        self.series.retain(|_, points| {
            while points.front().is_some_and(|p| p.timestamp < cutoff) {
                points.pop_front();
            }
            !points.is_empty()
        });
    }
}

#[derive(Default)]
struct Tallies {
    published: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    store_errors: AtomicU64,
}

/// Broker observer: metric collection, alerting, and tracing.
pub struct Monitor {
    config: MonitoringConfig,
    broker: Arc<Broker>,
    metrics: Arc<Mutex<MetricStore>>,
    alerts: Arc<AlertManager>,
    traces: Arc<TraceRegistry>,
    event_type_counts: Arc<Mutex<HashMap<String, u64>>>,
    tallies: Arc<Tallies>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl Monitor {
    pub fn new(broker: Arc<Broker>, config: MonitoringConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let alerts = Arc::new(AlertManager::new(
            config.alert_webhook_url.clone(),
            config.max_alert_age_secs,
        ));
        let traces = Arc::new(TraceRegistry::new(if config.tracing_enabled {
            config.sampling_rate
        } else {
            0.0
        }));
        Arc::new(Self {
            metrics: Arc::new(Mutex::new(MetricStore::new(Duration::from_secs(
                config.retention_secs,
            )))),
            alerts,
            traces,
            event_type_counts: Arc::new(Mutex::new(HashMap::new())),
            tallies: Arc::new(Tallies::default()),
            tasks: Mutex::new(Vec::new()),
            stop_tx,
            config,
            broker,
        })
    }

    /// Start the observer, collection, and health-poll tasks. No-op when
    /// monitoring is disabled or already started.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            debug!("Monitoring disabled, not starting");
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let _ = self.stop_tx.send(false);
        tasks.push(tokio::spawn(Arc::clone(self).observe_lifecycle(
            self.broker.lifecycle(),
            self.stop_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(self).collection_loop(self.stop_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).health_poll_loop(self.stop_tx.subscribe()),
        ));
        info!(
            collection_interval_secs = self.config.collection_interval_secs,
            tracing = self.config.tracing_enabled,
            "Monitoring started"
        );
    }

    /// Stop all monitor tasks and wait for them to exit.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("Monitoring stopped");
    }

    async fn observe_lifecycle(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<LifecycleEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
                event = rx.recv() => event,
            };
            match event {
                Ok(LifecycleEvent::Published {
                    id,
                    event_type,
                    timestamp,
                }) => {
                    self.tallies.published.fetch_add(1, Ordering::Relaxed);
                    *self
                        .event_type_counts
                        .lock()
                        .await
                        .entry(event_type.clone())
                        .or_insert(0) += 1;
                    self.traces.maybe_open(id, &event_type, timestamp).await;
                }
                Ok(LifecycleEvent::Consumed { id, timestamp, .. }) => {
                    self.tallies.consumed.fetch_add(1, Ordering::Relaxed);
                    if let Some(millis) = self.traces.close(id, timestamp).await {
                        self.metrics
                            .lock()
                            .await
                            .record("processing_latency_ms", millis);
                    }
                }
                Ok(LifecycleEvent::HandlerFailed { id, error, .. }) => {
                    self.tallies.failed.fetch_add(1, Ordering::Relaxed);
                    self.traces.log_error(id, &error).await;
                }
                Ok(LifecycleEvent::DeadLettered { .. }) => {
                    self.tallies.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(LifecycleEvent::StoreError { context, error, .. }) => {
                    self.tallies.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(context = %context, error = %error, "Observed store error");
                }
                Ok(LifecycleEvent::ConfigChanged { detail }) => {
                    info!(detail = %detail, "Observed configuration change");
                }
                Ok(LifecycleEvent::RetryScheduled { .. }) => {}
                Ok(LifecycleEvent::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Monitor lagged behind the lifecycle channel");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn collection_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.collection_interval_secs.max(1));
        let mut prev_consumed = 0u64;
        let mut prev_failed = 0u64;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.collect(interval, &mut prev_consumed, &mut prev_failed).await;
                }
            }
        }
    }

    async fn collect(&self, interval: Duration, prev_consumed: &mut u64, prev_failed: &mut u64) {
        let now = Utc::now();
        let consumed = self.tallies.consumed.load(Ordering::Relaxed);
        let failed = self.tallies.failed.load(Ordering::Relaxed);
        let consumed_delta = consumed.saturating_sub(*prev_consumed);
        let failed_delta = failed.saturating_sub(*prev_failed);
        *prev_consumed = consumed;
        *prev_failed = failed;

        let outcomes = consumed_delta + failed_delta;
        let error_rate = if outcomes == 0 {
            0.0
        } else {
            failed_delta as f64 / outcomes as f64
        };
        let throughput = consumed_delta as f64 / interval.as_secs_f64();

        let window_start = now
            - chrono::Duration::from_std(Duration::from_secs(self.config.retention_secs))
                .unwrap_or(chrono::Duration::MAX);

        {
            let mut metrics = self.metrics.lock().await;
            metrics.prune(now);
            metrics.record("events_published_total", self.tallies.published.load(Ordering::Relaxed) as f64);
            metrics.record("events_consumed_total", consumed as f64);
            metrics.record("events_failed_total", failed as f64);
            metrics.record(
                "events_dead_lettered_total",
                self.tallies.dead_lettered.load(Ordering::Relaxed) as f64,
            );
            metrics.record(
                "store_errors_total",
                self.tallies.store_errors.load(Ordering::Relaxed) as f64,
            );
            metrics.record("error_rate", error_rate);
            metrics.record("throughput", throughput);
            if let Some(latency) = metrics.avg_since("processing_latency_ms", window_start) {
                metrics.record("avg_processing_latency_ms", latency);
            }
            if let Some(bytes) = resident_memory_bytes() {
                metrics.record("memory_bytes", bytes as f64);
            }
        }

        self.traces.prune(now).await;
        self.alerts.expire(now).await;
        self.evaluate_thresholds(now).await;
    }

    async fn evaluate_thresholds(&self, now: DateTime<Utc>) {
        let values: Vec<(crate::config::AlertThreshold, f64)> = {
            let metrics = self.metrics.lock().await;
            self.config
                .thresholds
                .iter()
                .filter_map(|t| metrics.latest(&t.metric).map(|p| (t.clone(), p.value)))
                .collect()
        };
        for (threshold, value) in values {
            self.alerts.evaluate(&threshold, value, now).await;
        }
    }

    async fn health_poll_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let status = self.broker.status().await;
                    let depth = self.broker.queue_depth().await.unwrap_or(0);
                    let mut metrics = self.metrics.lock().await;
                    metrics.record("store_connected", if status.store_connected { 1.0 } else { 0.0 });
                    metrics.record("active_subscriptions", status.active_subscriptions as f64);
                    metrics.record("active_streams", status.active_streams as f64);
                    metrics.record("queue_depth", depth as f64);
                }
            }
        }
    }

    /// Currently open alerts.
    pub async fn open_alerts(&self) -> Vec<Alert> {
        self.alerts.open_alerts().await
    }

    /// Pull-oriented metric exposition.
    pub async fn exposition(&self) -> String {
        export::render_exposition(&*self.metrics.lock().await)
    }

    /// Push-oriented structured snapshot.
    pub async fn snapshot(&self) -> DashboardSnapshot {
        let now = Utc::now();
        let window_start = now
            - chrono::Duration::from_std(Duration::from_secs(self.config.retention_secs))
                .unwrap_or(chrono::Duration::MAX);
        let (metrics, series) = {
            let store = self.metrics.lock().await;
            export::snapshot_sections(&store, window_start)
        };
        let top = export::top_event_types(&*self.event_type_counts.lock().await, 10);
        let status = self.broker.status().await;
        DashboardSnapshot {
            generated_at: now,
            overall: status.overall,
            metrics,
            series,
            top_event_types: top,
            open_alerts: self.alerts.open_alerts().await,
        }
    }
}

/// Resident set size from `/proc/self/statm`, in bytes.
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_store_prunes_by_retention() {
        let mut store = MetricStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.record_at("x", 1.0, BTreeMap::new(), now - chrono::Duration::seconds(120));
        store.record_at("x", 2.0, BTreeMap::new(), now);
        store.prune(now);
        assert_eq!(store.points_since("x", now - chrono::Duration::hours(1)).len(), 1);
        assert_eq!(store.latest("x").unwrap().value, 2.0);
    }

    #[test]
    fn test_metric_store_drops_empty_series() {
        let mut store = MetricStore::new(Duration::from_secs(60));
        let now = Utc::now();
        store.record_at("gone", 1.0, BTreeMap::new(), now - chrono::Duration::seconds(120));
        store.prune(now);
        assert!(store.names().is_empty());
    }

    #[test]
    fn test_avg_since() {
        let mut store = MetricStore::new(Duration::from_secs(300));
        let now = Utc::now();
        store.record_at("lat", 10.0, BTreeMap::new(), now);
        store.record_at("lat", 30.0, BTreeMap::new(), now);
        assert_eq!(
            store.avg_since("lat", now - chrono::Duration::seconds(1)),
            Some(20.0)
        );
        assert_eq!(store.avg_since("missing", now), None);
    }

    #[test]
    fn test_resident_memory_readable() {
        // /proc is available on every target this runs on.
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
