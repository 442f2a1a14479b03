//! Metric export surfaces.
//!
//! Two shapes: a pull-oriented text exposition (one line per metric,
//! `name{label="value"} value timestamp`) and a push-oriented structured
//! snapshot aggregated over the live metric store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::alerts::Alert;
use super::{MetricPoint, MetricStore};
use crate::broker::HealthState;

/// Render the latest value of every tracked metric in exposition format.
pub fn render_exposition(store: &MetricStore) -> String {
    let mut out = String::new();
    for name in store.names() {
        if let Some(point) = store.latest(&name) {
            out.push_str(&exposition_line(&name, point));
            out.push('\n');
        }
    }
    out
}

fn exposition_line(name: &str, point: &MetricPoint) -> String {
    let labels = if point.labels.is_empty() {
        String::new()
    } else {
        let rendered: Vec<String> = point
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", rendered.join(","))
    };
    format!(
        "{}{} {} {}",
        name,
        labels,
        point.value,
        point.timestamp.timestamp_millis()
    )
}

/// Published-event count for one event type, for top-N breakdowns.
#[derive(Debug, Clone, Serialize)]
pub struct EventTypeCount {
    pub event_type: String,
    pub count: u64,
}

/// Structured dashboard snapshot: overview status, latest values,
/// recent time-series, top event types, and open alerts.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub overall: HealthState,
    pub metrics: BTreeMap<String, f64>,
    pub series: BTreeMap<String, Vec<MetricPoint>>,
    pub top_event_types: Vec<EventTypeCount>,
    pub open_alerts: Vec<Alert>,
}

/// Aggregate the snapshot's metric sections from the store.
pub(super) fn snapshot_sections(
    store: &MetricStore,
    since: DateTime<Utc>,
) -> (BTreeMap<String, f64>, BTreeMap<String, Vec<MetricPoint>>) {
    let mut metrics = BTreeMap::new();
    let mut series = BTreeMap::new();
    for name in store.names() {
        if let Some(point) = store.latest(&name) {
            metrics.insert(name.clone(), point.value);
        }
        let points = store.points_since(&name, since);
        if !points.is_empty() {
            series.insert(name, points);
        }
    }
    (metrics, series)
}

/// Top-N event types by descending count.
pub(super) fn top_event_types(
    counts: &std::collections::HashMap<String, u64>,
    n: usize,
) -> Vec<EventTypeCount> {
    let mut top: Vec<EventTypeCount> = counts
        .iter()
        .map(|(event_type, count)| EventTypeCount {
            event_type: event_type.clone(),
            count: *count,
        })
        .collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then(a.event_type.cmp(&b.event_type)));
    top.truncate(n);
    top
}

// =============================================================================
// Tests
// =============================================================================
