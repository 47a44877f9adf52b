//! Configuration types for routing-core
//!
//! This module defines all configuration structures. Configuration is loaded
//! from a JSON file; every section is optional and falls back to defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{DecisionCache, DEFAULT_CACHE_CAPACITY, DEFAULT_EVICTION_PERCENT};
use crate::coordinator::{
    CoordinatorOptions, RoutingCoordinator, ServiceConnector, UnixServiceConnector,
    DEFAULT_BUFFER, DEFAULT_EVENT_BUFFER, DEFAULT_MAX_ACTIVE_ROUTES, DEFAULT_REPLAY,
};
use crate::error::ConfigError;
use crate::geoip::{GeoIpLookup, DEFAULT_QUERY_CACHE_SIZE};
use crate::rules::{default_fallback_chain, RouteLookupEngine, RouteTable, RoutingRule};
use crate::sniff::{TrafficSniffer, DEFAULT_SNIFF_CACHE_CAPACITY};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Rules, outbound tags and fallback chain
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Decision cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Traffic sniffer
    #[serde(default)]
    pub sniff: SniffConfig,

    /// `GeoIP` database
    #[serde(default)]
    pub geoip: GeoIpConfig,

    /// Background service link
    #[serde(default)]
    pub service: ServiceConfig,

    /// Snapshot publication
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for out-of-range values, or
    /// `ConfigError::Rule` if the routing section does not build a valid
    /// route table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.routing.validate()?;
        self.cache.validate()?;
        self.sniff.validate()?;
        self.geoip.validate()?;
        self.service.validate()?;
        self.snapshot.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Build the initial route table
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Rule` if the rules are invalid.
    pub fn build_table(&self) -> Result<RouteTable, ConfigError> {
        self.routing.build_table()
    }

    /// Build the lookup engine (decision cache, sniffer and `GeoIP`)
    #[must_use]
    pub fn build_engine(&self) -> RouteLookupEngine {
        let cache = DecisionCache::new(self.cache.max_entries, self.cache.ttl())
            .with_eviction_percent(self.cache.eviction_percent);
        let sniffer = TrafficSniffer::new(self.sniff.cache_ttl(), self.sniff.cache_capacity);
        let geoip = match &self.geoip.database_path {
            Some(path) => GeoIpLookup::from_path(path.clone(), self.geoip.query_cache_size),
            None => GeoIpLookup::disabled(),
        };
        RouteLookupEngine::new(cache, sniffer, Arc::new(geoip))
    }

    /// Coordinator tuning from the `service` and `snapshot` sections
    #[must_use]
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            reconnect_backoff: self.service.reconnect_backoff(),
            replay: self.snapshot.replay,
            buffer: self.snapshot.buffer,
            max_active_routes: self.snapshot.max_active_routes,
            event_buffer: self.service.event_buffer,
            // Connect and registration reply are each bounded by connect_timeout
            link_timeout: self.service.connect_timeout() * 2,
        }
    }

    /// Build a coordinator wired to the configured service socket
    ///
    /// Without a socket path the coordinator runs standalone.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Rule` if the rules are invalid.
    pub fn build_coordinator(&self) -> Result<RoutingCoordinator, ConfigError> {
        let connector = self.service.socket_path.as_ref().map(|path| {
            Arc::new(
                UnixServiceConnector::new(path).with_connect_timeout(self.service.connect_timeout()),
            ) as Arc<dyn ServiceConnector>
        });
        Ok(RoutingCoordinator::new(
            self.build_table()?,
            self.build_engine(),
            connector,
            self.coordinator_options(),
        ))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, text, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate log configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for unknown levels or formats.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text" | "pretty") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

/// Routing section: everything that goes into the initial route table
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Run the traffic sniffer on stream flows
    #[serde(default = "default_true")]
    pub sniff_enabled: bool,

    /// Tags tried in order when no rule matches
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,

    /// Outbound tag to outbound id
    #[serde(default)]
    pub outbound_tags: HashMap<String, String>,

    /// Geosite category to domain suffixes
    #[serde(default)]
    pub geosite: HashMap<String, Vec<String>>,

    /// Routing rules
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

impl RoutingConfig {
    /// Build the route table this section describes
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Rule` with the first invalid rule or table
    /// setting.
    pub fn build_table(&self) -> Result<RouteTable, ConfigError> {
        let mut builder = RouteTable::builder()
            .rules(self.rules.iter().cloned())
            .outbound_tags(self.outbound_tags.clone())
            .sniff_enabled(self.sniff_enabled)
            .fallback_chain(self.fallback_chain.clone());
        for (category, suffixes) in &self.geosite {
            builder = builder.geosite_category(category.clone(), suffixes.iter().cloned());
        }
        Ok(builder.build()?)
    }

    /// Validate by building the table
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Rule` if the table does not build.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build_table().map(|_| ())
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sniff_enabled: true,
            fallback_chain: default_fallback_chain(),
            outbound_tags: HashMap::new(),
            geosite: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

/// Decision cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum cached decisions (0 disables the cache)
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Decision lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Share of entries evicted in one batch when full
    #[serde(default = "default_eviction_percent")]
    pub eviction_percent: u8,
}

impl CacheConfig {
    /// Get decision lifetime as Duration
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Validate cache configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero TTL or an eviction
    /// share outside 1-100.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.ttl_secs must be greater than 0".into(),
            ));
        }
        if !(1..=100).contains(&self.eviction_percent) {
            return Err(ConfigError::ValidationError(format!(
                "cache.eviction_percent must be 1-100, got {}",
                self.eviction_percent
            )));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_CAPACITY,
            ttl_secs: default_cache_ttl_secs(),
            eviction_percent: DEFAULT_EVICTION_PERCENT,
        }
    }
}

/// Sniffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SniffConfig {
    /// Lifetime of cached sniff results in seconds
    #[serde(default = "default_sniff_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum cached sniff results (0 disables the cache)
    #[serde(default = "default_sniff_cache_capacity")]
    pub cache_capacity: usize,
}

impl SniffConfig {
    /// Get sniff cache lifetime as Duration
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Validate sniffer configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero TTL with a non-zero
    /// capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity > 0 && self.cache_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sniff.cache_ttl_secs must be greater than 0 when caching".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_sniff_cache_ttl_secs(),
            cache_capacity: DEFAULT_SNIFF_CACHE_CAPACITY,
        }
    }
}

/// `GeoIP` configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GeoIpConfig {
    /// Path to the JSON country database (`GeoIP` disabled when absent)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Cached query answers
    #[serde(default = "default_geoip_query_cache_size")]
    pub query_cache_size: usize,
}

impl GeoIpConfig {
    /// Validate `GeoIP` configuration
    ///
    /// A missing database file is not an error here; lookups degrade to
    /// `None` at runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .database_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "geoip.database_path cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            query_cache_size: DEFAULT_QUERY_CACHE_SIZE,
        }
    }
}

/// Background service link configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unix socket of the background service (standalone when absent)
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Wait between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Service event channel capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl ServiceConfig {
    /// Get reconnect backoff as Duration
    #[must_use]
    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate service configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for zero timings or an empty
    /// socket path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .socket_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "service.socket_path cannot be empty".into(),
            ));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(ConfigError::ValidationError(
                "service.reconnect_backoff_ms must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "service.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Snapshot publication configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Snapshots replayed to late subscribers
    #[serde(default = "default_snapshot_replay")]
    pub replay: usize,

    /// Live buffer per subscriber
    #[serde(default = "default_snapshot_buffer")]
    pub buffer: usize,

    /// Hosts tracked in `active_routes`
    #[serde(default = "default_max_active_routes")]
    pub max_active_routes: usize,
}

impl SnapshotConfig {
    /// Validate snapshot configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero buffer or a replay
    /// larger than the buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer == 0 {
            return Err(ConfigError::ValidationError(
                "snapshot.buffer must be greater than 0".into(),
            ));
        }
        if self.replay > self.buffer {
            return Err(ConfigError::ValidationError(format!(
                "snapshot.replay ({}) cannot exceed snapshot.buffer ({})",
                self.replay, self.buffer
            )));
        }
        Ok(())
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            replay: DEFAULT_REPLAY,
            buffer: DEFAULT_BUFFER,
            max_active_routes: DEFAULT_MAX_ACTIVE_ROUTES,
        }
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

const fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_CAPACITY
}

const fn default_cache_ttl_secs() -> u64 {
    30
}

const fn default_eviction_percent() -> u8 {
    DEFAULT_EVICTION_PERCENT
}

const fn default_sniff_cache_ttl_secs() -> u64 {
    10
}

const fn default_sniff_cache_capacity() -> usize {
    DEFAULT_SNIFF_CACHE_CAPACITY
}

const fn default_geoip_query_cache_size() -> usize {
    DEFAULT_QUERY_CACHE_SIZE
}

const fn default_reconnect_backoff_ms() -> u64 {
    500
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

const fn default_snapshot_replay() -> usize {
    DEFAULT_REPLAY
}

const fn default_snapshot_buffer() -> usize {
    DEFAULT_BUFFER
}

const fn default_max_active_routes() -> usize {
    DEFAULT_MAX_ACTIVE_ROUTES
}
