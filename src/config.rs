//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Main configuration for the admission engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Master switch; when false every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Defaults applied to rules that omit a value
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Allow/deny list switches
    #[serde(default)]
    pub lists: ListsConfig,

    /// Rule storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Background cleanup
    #[serde(default)]
    pub janitor: JanitorConfig,

    /// Request audit log
    #[serde(default)]
    pub audit: AuditConfig,

    /// Alerting thresholds
    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            limits: LimitsConfig::default(),
            lists: ListsConfig::default(),
            storage: StorageConfig::default(),
            janitor: JanitorConfig::default(),
            audit: AuditConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Rule defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per window for rules created without a limit
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window length in milliseconds for rules created without one
    #[serde(default = "default_window_ms")]
    pub default_window_ms: u64,

    /// Upper bound for a rule's burst allowance
    #[serde(default = "default_max_burst")]
    pub max_burst: u64,

    /// Block duration in milliseconds for rules created without one
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            max_burst: default_max_burst(),
            block_duration_ms: default_block_duration_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn default_window(&self) -> Duration {
        Duration::from_millis(self.default_window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_burst() -> u64 {
    10
}

fn default_block_duration_ms() -> u64 {
    300_000
}

/// Allow/deny list switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListsConfig {
    #[serde(default = "default_enabled")]
    pub enable_allowlist: bool,

    #[serde(default = "default_enabled")]
    pub enable_denylist: bool,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            enable_allowlist: true,
            enable_denylist: true,
        }
    }
}

/// Where rule definitions live between restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Rules live only in process memory
    #[default]
    Memory,
    /// Rules are restored from and persisted to a `RuleRepository`
    External,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

/// Janitor timing and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Sweep interval in milliseconds
    #[serde(default = "default_janitor_interval_ms")]
    pub interval_ms: u64,

    /// Maximum age of audit records in milliseconds
    #[serde(default = "default_record_retention_ms")]
    pub record_retention_ms: u64,

    /// Maximum age of alerts in milliseconds
    #[serde(default = "default_alert_retention_ms")]
    pub alert_retention_ms: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_janitor_interval_ms(),
            record_retention_ms: default_record_retention_ms(),
            alert_retention_ms: default_alert_retention_ms(),
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn record_retention(&self) -> Duration {
        Duration::from_millis(self.record_retention_ms)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_millis(self.alert_retention_ms)
    }
}

fn default_janitor_interval_ms() -> u64 {
    300_000
}

fn default_record_retention_ms() -> u64 {
    86_400_000
}

fn default_alert_retention_ms() -> u64 {
    604_800_000
}

/// Audit log sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Maximum number of records kept before the oldest are dropped
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
        }
    }
}

fn default_audit_capacity() -> usize {
    100_000
}

/// Alerting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Maximum number of alerts retained in memory
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,

    /// Multiple of the rule limit at which a blocked identifier is
    /// reported as a persistent violator
    #[serde(default = "default_persistent_violation_factor")]
    pub persistent_violation_factor: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_alerts: default_max_alerts(),
            persistent_violation_factor: default_persistent_violation_factor(),
        }
    }
}

fn default_max_alerts() -> usize {
    10_000
}

fn default_persistent_violation_factor() -> u64 {
    2
}

impl TurnstileConfig {
    /// Load configuration from an optional file, overlaid with
    /// `TURNSTILE__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading engine configuration");
            builder = builder.add_source(config::File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.default_limit == 0 {
            return Err(TurnstileError::Configuration(
                "default_limit must be greater than 0".to_string(),
            ));
        }
        if self.limits.default_window_ms == 0 {
            return Err(TurnstileError::Configuration(
                "default_window_ms must be greater than 0".to_string(),
            ));
        }
        if self.janitor.interval_ms == 0 {
            return Err(TurnstileError::Configuration(
                "janitor interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
