//! routing-core: routing decision engine for a proxy client
//!
//! Decides, per outgoing flow, whether it goes through the proxy, goes
//! direct, is blocked, or uses a named outbound.
//!
//! # Features
//!
//! - **Priority rules**: app, domain (full / suffix / geosite), CIDR, port,
//!   protocol, country, time window and network type matchers
//! - **Pre-DNS sniffing**: host names from TLS SNI and HTTP requests
//! - **Decision cache**: bounded, TTL-based, batch eviction
//! - **Lazy `GeoIP`**: on-device country database loaded on first use
//! - **Coordinator**: lock-free table swaps, snapshot fan-out and a
//!   supervised link to the background service
//!
//! # Architecture
//!
//! ```text
//! flow → DecisionCache → TrafficSniffer → rules by priority → GeoIpLookup → fallback chain
//!                                    ↑
//!             RoutingCoordinator (ArcSwap<RouteTable>, snapshots, service link)
//! ```
//!
//! # Quick Start
//!
//! ```
//! use routing_core::rules::{
//!     Action, FlowDescriptor, FlowProtocol, Matcher, RouteLookupEngine, RouteTable, RoutingRule,
//! };
//!
//! let table = RouteTable::builder()
//!     .rule(RoutingRule::new("ads", vec![Matcher::domain_suffix(["ads.example"])], Action::Block))
//!     .build()
//!     .unwrap();
//!
//! let engine = RouteLookupEngine::default();
//! let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("cdn.ads.example");
//! assert!(engine.lookup(&flow, &table).action.is_block());
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Decision cache
//! - [`config`]: Configuration types and loading
//! - [`coordinator`]: Table ownership, snapshots, service link
//! - [`error`]: Error types
//! - [`geoip`]: Country lookup
//! - [`rules`]: Rule model, route table and lookup engine
//! - [`sniff`]: HTTP Host / TLS SNI sniffing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geoip;
pub mod rules;
pub mod sniff;

// Re-export commonly used types at the crate root
pub use cache::{CacheKey, DecisionCache};
pub use config::{load_config, load_config_with_env, Config};
pub use coordinator::{
    CoordinatorState, RouteSnapshot, RoutingCoordinator, ServiceConnector, ServiceEvent,
    UnixServiceConnector,
};
pub use error::{ConfigError, GeoIpError, RouterError, RuleError, ServiceError};
pub use geoip::GeoIpLookup;
pub use rules::{
    Action, FlowDescriptor, FlowProtocol, MatchLevel, Matcher, RouteDecision, RouteLookupEngine,
    RouteTable, RoutingRule,
};
pub use sniff::{SniffProtocol, SniffResult, TrafficSniffer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
