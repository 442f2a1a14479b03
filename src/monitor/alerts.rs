//! Alert lifecycle.
//!
//! One open alert per metric. A breach opens an alert and emits it to
//! the log sink and, when configured, a webhook. Open alerts are
//! re-evaluated every cycle: they auto-resolve when the metric recovers
//! past a 20% hysteresis margin beyond the threshold, or are
//! force-resolved once they exceed the maximum alert age.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AlertThreshold, ThresholdDirection};

/// Hysteresis margin: a breached metric must recover this far past its
/// threshold before the alert resolves.
const HYSTERESIS_MARGIN: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// An open threshold breach.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub context: String,
}

pub struct AlertManager {
    open: Mutex<HashMap<String, Alert>>,
    webhook_url: Option<String>,
    max_age: Duration,
    http: reqwest::Client,
}

impl AlertManager {
    pub fn new(webhook_url: Option<String>, max_age_secs: u64) -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            webhook_url,
            max_age: Duration::from_secs(max_age_secs),
            http: reqwest::Client::new(),
        }
    }

    /// Evaluate one threshold against the metric's latest value,
    /// opening or resolving its alert as needed.
    pub async fn evaluate(&self, threshold: &AlertThreshold, value: f64, now: DateTime<Utc>) {
        let breached = match threshold.direction {
            ThresholdDirection::Above => value > threshold.value,
            ThresholdDirection::Below => value < threshold.value,
        };

        let mut open = self.open.lock().await;
        match open.get_mut(&threshold.metric) {
            None if breached => {
                let alert = Alert {
                    id: Uuid::new_v4(),
                    severity: severity_for(threshold, value),
                    metric: threshold.metric.clone(),
                    current_value: value,
                    threshold: threshold.value,
                    timestamp: now,
                    context: format!(
                        "{} is {} (threshold {})",
                        threshold.metric, value, threshold.value
                    ),
                };
                warn!(
                    metric = %alert.metric,
                    value = alert.current_value,
                    threshold = alert.threshold,
                    severity = ?alert.severity,
                    "Alert opened"
                );
                self.deliver(&alert);
                open.insert(threshold.metric.clone(), alert);
            }
            Some(alert) => {
                alert.current_value = value;
                if recovered(threshold, value) {
                    info!(metric = %alert.metric, value, "Alert resolved");
                    open.remove(&threshold.metric);
                }
            }
            None => {}
        }
    }

    /// Force-resolve alerts older than the maximum age regardless of the
    /// metric's current state.
    pub async fn expire(&self, now: DateTime<Utc>) {
        let mut open = self.open.lock().await;
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        open.retain(|metric, alert| {
            let keep = now.signed_duration_since(alert.timestamp) <= max_age;
            if !keep {
                info!(metric = %metric, "Alert force-resolved after maximum age");
            }
            keep
        });
    }

    pub async fn open_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.open.lock().await.values().cloned().collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    /// Fire-and-forget webhook delivery; the log sink already has the
    /// alert.
    fn deliver(&self, alert: &Alert) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };
        let body = json!(alert);
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(e) = http.post(&url).json(&body).send().await {
                error!(url = %url, error = %e, "Alert webhook delivery failed");
            }
        });
    }
}

/// Severity scales with how far past the threshold the metric is:
/// twice the threshold (or worse) is critical, 1.5x is a warning, and a
/// marginal breach is informational.
fn severity_for(threshold: &AlertThreshold, value: f64) -> Severity {
    let ratio = match threshold.direction {
        ThresholdDirection::Above if threshold.value.abs() > f64::EPSILON => {
            value / threshold.value
        }
        ThresholdDirection::Below if value.abs() > f64::EPSILON => threshold.value / value,
        _ => 2.0,
    };
    if ratio >= 2.0 {
        Severity::Critical
    } else if ratio >= 1.5 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

fn recovered(threshold: &AlertThreshold, value: f64) -> bool {
    match threshold.direction {
        ThresholdDirection::Above => value <= threshold.value * (1.0 - HYSTERESIS_MARGIN),
        ThresholdDirection::Below => value >= threshold.value * (1.0 + HYSTERESIS_MARGIN),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn error_rate_threshold() -> AlertThreshold {
        AlertThreshold {
            metric: "error_rate".into(),
            value: 0.1,
            direction: ThresholdDirection::Above,
        }
    }

    #[tokio::test]
    async fn test_breach_opens_single_alert() {
        let manager = AlertManager::new(None, 3600);
        let threshold = error_rate_threshold();
        let now = Utc::now();

        manager.evaluate(&threshold, 0.5, now).await;
        manager.evaluate(&threshold, 0.6, now).await;

        let alerts = manager.open_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "error_rate");
        assert_eq!(alerts[0].threshold, 0.1);
        assert_eq!(alerts[0].current_value, 0.6);
    }

    #[tokio::test]
    async fn test_alert_resolves_past_hysteresis() {
        let manager = AlertManager::new(None, 3600);
        let threshold = error_rate_threshold();
        let now = Utc::now();

        manager.evaluate(&threshold, 0.5, now).await;
        // Below the threshold but still inside the hysteresis margin.
        manager.evaluate(&threshold, 0.09, now).await;
        assert_eq!(manager.open_alerts().await.len(), 1);

        manager.evaluate(&threshold, 0.05, now).await;
        assert!(manager.open_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_below_direction() {
        let manager = AlertManager::new(None, 3600);
        let threshold = AlertThreshold {
            metric: "throughput".into(),
            value: 10.0,
            direction: ThresholdDirection::Below,
        };
        let now = Utc::now();

        manager.evaluate(&threshold, 2.0, now).await;
        assert_eq!(manager.open_alerts().await.len(), 1);

        manager.evaluate(&threshold, 13.0, now).await;
        assert!(manager.open_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_resolve_after_max_age() {
        let manager = AlertManager::new(None, 60);
        let threshold = error_rate_threshold();
        let opened = Utc::now() - chrono::Duration::seconds(120);

        manager.evaluate(&threshold, 0.5, opened).await;
        assert_eq!(manager.open_alerts().await.len(), 1);

        manager.expire(Utc::now()).await;
        assert!(manager.open_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_severity_scales_with_breach() {
        let manager = AlertManager::new(None, 3600);
        let threshold = error_rate_threshold();
        manager.evaluate(&threshold, 0.12, Utc::now()).await;
        assert_eq!(manager.open_alerts().await[0].severity, Severity::Info);

        let manager = AlertManager::new(None, 3600);
        manager.evaluate(&threshold, 0.16, Utc::now()).await;
        assert_eq!(manager.open_alerts().await[0].severity, Severity::Warning);

        let manager = AlertManager::new(None, 3600);
        manager.evaluate(&threshold, 0.5, Utc::now()).await;
        assert_eq!(manager.open_alerts().await[0].severity, Severity::Critical);
    }
}
