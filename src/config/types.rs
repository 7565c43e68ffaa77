use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Engine behaviour
    pub engine: EngineSettings,

    /// Region law table source
    pub policy: PolicySourceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Minimum score for a compliant report
    pub compliance_threshold: u8,

    /// Seconds after the last successful sync before reads are flagged stale
    pub staleness_window_secs: u64,

    /// Days a parent has to answer a consent request
    pub parental_consent_timeout_days: u32,

    /// Upper bound for a single remote call in milliseconds
    pub remote_timeout_ms: u64,

    /// Retry behaviour for transient remote failures
    pub retry: RetrySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            compliance_threshold: 80,
            staleness_window_secs: 300,
            parental_consent_timeout_days: 14,
            remote_timeout_ms: 10_000,
            retry: RetrySettings::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per remote call (1 = no automatic retry)
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Cap for the backoff delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Region table source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySourceConfig {
    /// TOML region table; the built-in table is used when unset
    pub region_table: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (error, warn, info, debug, trace)
    pub level: String,

    /// Log format
    pub format: LogFormat,

    /// Write to stderr
    pub console: bool,

    /// Directory for rolling log files; file output is disabled when unset
    pub directory: Option<PathBuf>,

    /// Rolling file name prefix
    pub file_prefix: String,

    /// Log rotation
    pub rotation: RotationStrategy,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            console: true,
            directory: None,
            file_prefix: "privacy-compliance.log".to_string(),
            rotation: RotationStrategy::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStrategy {
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "never")]
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Pretty-printed format
    #[serde(rename = "pretty")]
    Pretty,

    /// JSON format
    #[serde(rename = "json")]
    Json,

    /// Compact format
    #[serde(rename = "compact")]
    Compact,
}
