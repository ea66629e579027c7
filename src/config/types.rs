use crate::logging::{LogConfig, LogFormat, LogRotation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-level configuration (`config.yaml` layered under `MUSTER_`
/// environment overrides). Mirrors the persistent state layout's
/// `config.yaml` from the external interfaces section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusterConfig {
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorTransport {
    StreamableHttp,
    Sse,
    Stdio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub host: String,
    pub port: u16,
    pub transport: AggregatorTransport,
    /// Prefix applied to every federated tool/resource/prompt name.
    pub prefix: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8090,
            transport: AggregatorTransport::StreamableHttp,
            prefix: "x".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Filesystem,
    Crd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Root directory holding `mcpservers/`, `serviceclasses/`,
    /// `workflows/`, `capabilities/`. Only meaningful when `kind` is
    /// `filesystem`.
    pub path: Option<PathBuf>,
    /// Kubernetes namespace to watch. Only meaningful when `kind` is `crd`.
    pub namespace: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Filesystem,
            path: Some(PathBuf::from("./muster-state")),
            namespace: None,
        }
    }
}

/// Per §9 Open Questions: both thresholds are inferred from behavior, so
/// both are exposed as configuration rather than hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive health check failures before Running → Unhealthy.
    pub health_failure_threshold: u32,
    /// Consecutive health check failures (from entering Unhealthy) before
    /// Unhealthy → Failed.
    pub unhealthy_failure_threshold: u32,
    /// Default interval between health checks when a ServiceDefinition
    /// does not specify its own.
    pub default_interval_secs: u64,
    /// Default per-check timeout.
    pub default_timeout_secs: u64,
    /// Continuous Running span required before restartCount resets to 0.
    pub restart_count_reset_after_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_failure_threshold: 3,
            unhealthy_failure_threshold: 5,
            default_interval_secs: 10,
            default_timeout_secs: 5,
            restart_count_reset_after_secs: 600,
            start_timeout_secs: 30,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub worker_count: usize,
    pub resync_interval_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub max_attempts: u32,
    pub per_key_timeout_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            resync_interval_secs: 600,
            backoff_base_ms: 1_000,
            backoff_cap_secs: 300,
            max_attempts: 5,
            per_key_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatConfig {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotationConfig {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormatConfig,
    pub file: Option<PathBuf>,
    pub rotation: LogRotationConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormatConfig::Pretty,
            file: None,
            rotation: LogRotationConfig::Daily,
        }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(c: &LoggingConfig) -> Self {
        LogConfig {
            level: c.level.clone(),
            format: match c.format {
                LogFormatConfig::Pretty => LogFormat::Pretty,
                LogFormatConfig::Json => LogFormat::Json,
                LogFormatConfig::Compact => LogFormat::Compact,
            },
            file: c.file.clone(),
            rotation: match c.rotation {
                LogRotationConfig::Daily => LogRotation::Daily,
                LogRotationConfig::Hourly => LogRotation::Hourly,
                LogRotationConfig::Never => LogRotation::Never,
            },
        }
    }
}

impl Default for MusterConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
