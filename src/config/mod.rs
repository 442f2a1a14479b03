//! Application configuration.
//!
//! Aggregates the broker configuration surface into a single `Config`
//! struct loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::envelope::{Priority, RetryPolicy};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STRATUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STRATUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STRATUS_LOG";

/// Default stream key prefix. Streams live at `{prefix}:streams:{event_type}`.
pub const DEFAULT_KEY_PREFIX: &str = "stratus";
/// Default dead-letter key prefix. Records live at `{prefix}:{timestamp}`.
pub const DEFAULT_DLQ_PREFIX: &str = "stratus:dlq";
/// Default dead-letter retention (7 days).
pub const DEFAULT_DLQ_RETENTION_SECS: u64 = 7 * 24 * 3600;
/// Default per-stream retention when none is provisioned.
pub const DEFAULT_STREAM_MAX_LEN: u64 = 10_000;
/// Default read batch size.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Default blocking-read timeout in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5_000;
/// Default interval between stale-pending reclaim sweeps in milliseconds.
pub const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 10_000;
/// Default minimum idle time before a pending entry is reclaimed.
pub const DEFAULT_RECLAIM_MIN_IDLE_MS: u64 = 60_000;
/// Default staleness window for cross-tenant messages (5 minutes).
pub const DEFAULT_STALENESS_WINDOW_SECS: u64 = 300;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream store connection.
    pub store: StoreConfig,
    /// Batching and delivery tuning.
    pub performance: PerformanceConfig,
    /// Monitoring, alerting, and tracing.
    pub monitoring: MonitoringConfig,
    /// Publish-time defaults applied when options omit them.
    pub defaults: DefaultsConfig,
    /// Dead-letter behavior.
    pub dead_letter: DeadLetterConfig,
    /// Cross-tenant messaging.
    pub tenancy: TenancyConfig,
    /// Service-registry bridge.
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by the `path` argument (if provided)
    /// 3. File named by `STRATUS_CONFIG` (if set)
    /// 4. Environment variables with the `STRATUS` prefix
    pub fn load(path: Option<&str>) -> crate::Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::BusError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| crate::BusError::Config(e.to_string()))
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Stream store connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store connection URL (e.g. `redis://localhost:6379`).
    pub url: String,
    /// Prefix for all stream and record keys.
    pub key_prefix: String,
    /// Additional cluster node URLs.
    pub cluster_nodes: Vec<String>,
    /// Optional credentials.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            cluster_nodes: Vec::new(),
            username: None,
            password: None,
        }
    }
}

/// Batching and throughput tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Maximum messages fetched (and dispatched concurrently) per read.
    pub batch_size: usize,
    /// Blocking-read timeout in milliseconds.
    pub batch_timeout_ms: u64,
    /// Milliseconds between sweeps for stale pending entries.
    pub reclaim_interval_ms: u64,
    /// Minimum unacknowledged idle time, in milliseconds, before a pending
    /// entry is reclaimed and redelivered.
    pub reclaim_min_idle_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            reclaim_interval_ms: DEFAULT_RECLAIM_INTERVAL_MS,
            reclaim_min_idle_ms: DEFAULT_RECLAIM_MIN_IDLE_MS,
        }
    }
}

/// An alert threshold: `metric` breaches when its latest value crosses
/// `value` in `direction`.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertThreshold {
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub direction: ThresholdDirection,
}

/// Which side of the threshold is a breach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    /// Breach when value > threshold (error rate, latency, queue depth).
    #[default]
    Above,
    /// Breach when value < threshold (throughput).
    Below,
}

/// Monitoring, alerting, and tracing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// Seconds between metric collection ticks.
    pub collection_interval_secs: u64,
    /// Seconds between broker status polls.
    pub health_check_interval_secs: u64,
    /// Metric retention window in seconds.
    pub retention_secs: u64,
    pub tracing_enabled: bool,
    /// Fraction of published events that open a trace span.
    pub sampling_rate: f64,
    /// Webhook for alert delivery; alerts always go to the log sink.
    pub alert_webhook_url: Option<String>,
    /// Force-resolve alerts older than this regardless of metric state.
    pub max_alert_age_secs: u64,
    pub thresholds: Vec<AlertThreshold>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_secs: 10,
            health_check_interval_secs: 30,
            retention_secs: 3600,
            tracing_enabled: true,
            sampling_rate: 0.1,
            alert_webhook_url: None,
            max_alert_age_secs: 1800,
            thresholds: vec![
                AlertThreshold {
                    metric: "error_rate".to_string(),
                    value: 0.1,
                    direction: ThresholdDirection::Above,
                },
                AlertThreshold {
                    metric: "avg_processing_latency_ms".to_string(),
                    value: 5_000.0,
                    direction: ThresholdDirection::Above,
                },
                AlertThreshold {
                    metric: "queue_depth".to_string(),
                    value: 10_000.0,
                    direction: ThresholdDirection::Above,
                },
                AlertThreshold {
                    metric: "throughput".to_string(),
                    value: 0.0,
                    direction: ThresholdDirection::Below,
                },
            ],
        }
    }
}

/// Publish-time defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub ttl_seconds: Option<u64>,
    pub priority: Priority,
    pub retry: RetryPolicy,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: None,
            priority: Priority::Normal,
            retry: RetryPolicy::default(),
        }
    }
}

/// Dead-letter behavior.
///
/// When disabled, messages that exhaust their retry budget are dropped
/// after acknowledgment. That is the documented data-loss policy; the drop
/// is logged, never silent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    /// Records stored under `{key_prefix}:{timestamp}`.
    pub key_prefix: String,
    pub retention_seconds: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: DEFAULT_DLQ_PREFIX.to_string(),
            retention_seconds: DEFAULT_DLQ_RETENTION_SECS,
        }
    }
}

/// Cross-tenant messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    /// Bus-level signing key, used when a project has no signing secret.
    pub signing_key: String,
    /// Reject inbound messages older than this.
    pub staleness_window_secs: u64,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            signing_key: "change-me".to_string(),
            staleness_window_secs: DEFAULT_STALENESS_WINDOW_SECS,
        }
    }
}

/// Service-registry bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds between rescans of healthy services for new capabilities.
    pub rescan_interval_secs: u64,
    /// Timeout for forwarding an event to a service endpoint.
    pub forward_timeout_secs: u64,
    /// Forwarding failures tolerated before a service is marked degraded.
    pub failure_threshold: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: 60,
            forward_timeout_secs: 10,
            failure_threshold: 3,
        }
    }
}
