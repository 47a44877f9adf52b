//! Configuration module for routing-core
//!
//! This module provides configuration types and loading utilities, plus the
//! builders that turn a [`Config`] into a route table, lookup engine and
//! coordinator.
//!
//! # Example
//!
//! ```no_run
//! use routing_core::config::load_config_with_env;
//!
//! let config = load_config_with_env("/etc/routing-core/config.json").unwrap();
//! let coordinator = config.build_coordinator().unwrap();
//! println!("Rules: {}", coordinator.current_route_table().len());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_CACHE_TTL_SECS, ENV_GEOIP_PATH, ENV_LOG_LEVEL, ENV_SERVICE_SOCKET,
};
pub use types::{
    CacheConfig, Config, GeoIpConfig, LogConfig, RoutingConfig, ServiceConfig, SnapshotConfig,
    SniffConfig,
};
