//! Log subscriber setup
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else logging.level)
//!   └── Fmt Layer (json or pretty)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::config::LoggingConfig;
//! use chunk_uploadr::logging::init_logging;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! init_logging(&LoggingConfig::default())?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Logging errors
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the level filter. `RUST_LOG` wins over the configured level.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter {
        directive: level.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_filter(&config.level)?;

    let result = if config.format == "pretty" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true);
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
