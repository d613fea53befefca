//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{validate_capacity, validate_fill_rate, Result, TollgateError};
use crate::ratelimit::{Algorithm, FailurePolicy, KeyStrategy, StoreKind};

/// Prefix for environment overrides, e.g. `TOLLGATE__LIMITER__FILL_RATE=2.5`.
const ENV_PREFIX: &str = "TOLLGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Rejection sink configuration
    #[serde(default)]
    pub sink: SinkSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Tokens added per second
    #[serde(default = "default_fill_rate")]
    pub fill_rate: f64,

    /// Maximum tokens a bucket may hold
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Which part of a request names its bucket
    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Key used when the selected identity is missing
    #[serde(default)]
    pub anonymous_key: Option<String>,

    /// Verdict when the limiter itself fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bucket store backing
    #[serde(default)]
    pub store: StoreKind,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            fill_rate: default_fill_rate(),
            capacity: default_capacity(),
            key_strategy: KeyStrategy::default(),
            anonymous_key: None,
            failure_policy: FailurePolicy::default(),
            store: StoreKind::default(),
        }
    }
}

fn default_fill_rate() -> f64 {
    5.0
}

fn default_capacity() -> u64 {
    10
}

/// Rejection sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Maximum records held before the oldest is discarded (unbounded if unset)
    #[serde(default)]
    pub max_records: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load layered configuration: defaults, then an optional YAML file,
    /// then `TOLLGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make bucket arithmetic meaningless.
    pub fn validate(&self) -> Result<()> {
        validate_fill_rate(self.limiter.fill_rate)?;
        validate_capacity(self.limiter.capacity)?;
        if self.sink.max_records == Some(0) {
            return Err(TollgateError::Config(
                "sink.max_records must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}
