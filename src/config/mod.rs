//! Configuration module for Chunk Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every section has defaults,
//! so an empty file is a valid configuration.
//!
//! ```yaml
//! server:
//!   address: "0.0.0.0:8080"
//! storage:
//!   root: "${UPLOAD_ROOT:-/var/lib/chunk-uploadr}"
//! upload:
//!   chunk_size_limit: 52428800
//!   incomplete_upload_expiry_secs: 86400
//!   idle_timeout_secs: 60
//! logging:
//!   level: "info"
//!   format: "json"
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with an uppercase letter or underscore and
/// contain only uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |caps: &regex_lite::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Server address cannot be empty".into(),
            ));
        }

        if self.storage.root.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Storage root cannot be empty".into(),
            ));
        }

        self.upload.validate()?;

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::ValidationError(
                "Metrics port must be set when metrics are enabled".into(),
            ));
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'json' or 'pretty'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Where the filesystem backend writes finished uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> String {
    "/var/lib/chunk-uploadr".to_string()
}

/// Upload coordinator configuration
///
/// All values are fixed for the lifetime of an `UploadManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Size of every part except the last one of a stream
    #[serde(default = "default_chunk_size_limit")]
    pub chunk_size_limit: usize,

    /// How long an incomplete upload is kept without progress or resume
    #[serde(default = "default_incomplete_upload_expiry")]
    pub incomplete_upload_expiry_secs: u64,

    /// How long a worker waits for the next chunk before giving up the round
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Uploads waiting for the dispatcher
    #[serde(default = "default_intake_queue_capacity")]
    pub intake_queue_capacity: usize,

    /// Status events buffered per upload
    #[serde(default = "default_notifier_capacity")]
    pub notifier_capacity: usize,

    /// Upper bound on chunks buffered between feeder and worker
    #[serde(default = "default_max_queued_parts")]
    pub max_queued_parts: usize,
}

impl UploadConfig {
    pub fn incomplete_upload_expiry(&self) -> Duration {
        Duration::from_secs(self.incomplete_upload_expiry_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("chunk_size_limit", self.chunk_size_limit as u64),
            (
                "incomplete_upload_expiry_secs",
                self.incomplete_upload_expiry_secs,
            ),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("intake_queue_capacity", self.intake_queue_capacity as u64),
            ("notifier_capacity", self.notifier_capacity as u64),
            ("max_queued_parts", self.max_queued_parts as u64),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "upload.{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_limit: default_chunk_size_limit(),
            incomplete_upload_expiry_secs: default_incomplete_upload_expiry(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            intake_queue_capacity: default_intake_queue_capacity(),
            notifier_capacity: default_notifier_capacity(),
            max_queued_parts: default_max_queued_parts(),
        }
    }
}

fn default_chunk_size_limit() -> usize {
    52428800 // 50MB
}

fn default_incomplete_upload_expiry() -> u64 {
    86400 // 24h
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_intake_queue_capacity() -> usize {
    20
}

fn default_notifier_capacity() -> usize {
    4
}

fn default_max_queued_parts() -> usize {
    8
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Log output configuration
///
/// `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}
