//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::SimulatorConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<SimulatorConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: SimulatorConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        buckets = config.table.buckets,
        max_records = config.table.max_records,
        keepalive = config.table.keepalive,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<SimulatorConfig, ConfigError> {
    let config: SimulatorConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `FLOWSTATE_LOG_LEVEL`: Override log level
/// - `FLOWSTATE_MAX_RECORDS`: Override the record limit
/// - `FLOWSTATE_BUCKETS`: Override the initial bucket count
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<SimulatorConfig, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("FLOWSTATE_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(max) = std::env::var("FLOWSTATE_MAX_RECORDS") {
        config.table.max_records = max.parse().map_err(|_| ConfigError::EnvError {
            name: "FLOWSTATE_MAX_RECORDS".into(),
            reason: format!("Invalid number: {max}"),
        })?;
        debug!("Max records overridden to {}", config.table.max_records);
    }

    if let Ok(buckets) = std::env::var("FLOWSTATE_BUCKETS") {
        config.table.buckets = buckets.parse().map_err(|_| ConfigError::EnvError {
            name: "FLOWSTATE_BUCKETS".into(),
            reason: format!("Invalid number: {buckets}"),
        })?;
        debug!("Bucket count overridden to {}", config.table.buckets);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Write the default configuration to a file
///
/// # Errors
///
/// Returns `ConfigError` if serialization or writing fails.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = SimulatorConfig::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
