//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Override for `log.level`
pub const ENV_LOG_LEVEL: &str = "ROUTING_CORE_LOG_LEVEL";

/// Override for `geoip.database_path`
pub const ENV_GEOIP_PATH: &str = "ROUTING_CORE_GEOIP_PATH";

/// Override for `cache.ttl_secs`
pub const ENV_CACHE_TTL_SECS: &str = "ROUTING_CORE_CACHE_TTL_SECS";

/// Override for `service.socket_path`
pub const ENV_SERVICE_SOCKET: &str = "ROUTING_CORE_SERVICE_SOCKET";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        rules = config.routing.rules.len(),
        outbound_tags = config.routing.outbound_tags.len(),
        geoip = config.geoip.database_path.is_some(),
        service = config.service.socket_path.is_some(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `ROUTING_CORE_LOG_LEVEL`: Override log level
/// - `ROUTING_CORE_GEOIP_PATH`: Override `GeoIP` database path
/// - `ROUTING_CORE_CACHE_TTL_SECS`: Override decision cache TTL
/// - `ROUTING_CORE_SERVICE_SOCKET`: Override background service socket
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails, or an override is
/// malformed.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

/// Apply overrides from a variable lookup, then re-validate
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for a malformed value, or a validation
/// error for the overridden configuration.
pub fn apply_env_overrides(
    mut config: Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    if let Some(level) = var(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(path) = var(ENV_GEOIP_PATH) {
        config.geoip.database_path = Some(path.into());
        debug!("GeoIP database overridden to {:?}", config.geoip.database_path);
    }

    if let Some(ttl) = var(ENV_CACHE_TTL_SECS) {
        config.cache.ttl_secs = ttl.trim().parse().map_err(|_| ConfigError::EnvError {
            name: ENV_CACHE_TTL_SECS.into(),
            reason: format!("Invalid number: {ttl}"),
        })?;
        debug!("Cache TTL overridden to {}s", config.cache.ttl_secs);
    }

    if let Some(socket) = var(ENV_SERVICE_SOCKET) {
        config.service.socket_path = Some(socket.into());
        debug!("Service socket overridden to {:?}", config.service.socket_path);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
