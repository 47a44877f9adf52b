//! Route lookup engine
//!
//! Turns a flow descriptor into a [`RouteDecision`] against a given
//! [`RouteTable`]. The pipeline is:
//!
//! 1. Decision cache (keyed by host, payload hash or IP, plus every flow
//!    attribute a matcher can see)
//! 2. Traffic sniffing of the first bytes (stream protocols only)
//! 3. Rules by priority, with `GeoIP` rules deferred
//! 4. `GeoIP` lookup and the deferred rules
//! 5. Fallback chain
//!
//! A lookup always produces a decision; there is no "no route" outcome.
//!
//! # Example
//!
//! ```
//! use routing_core::rules::{
//!     Action, FlowDescriptor, FlowProtocol, Matcher, MatchLevel, RouteLookupEngine,
//!     RouteTable, RoutingRule,
//! };
//!
//! let table = RouteTable::builder()
//!     .rule(RoutingRule::new(
//!         "games",
//!         vec![Matcher::domain_suffix(["example.com"])],
//!         Action::Proxy,
//!     ))
//!     .build()
//!     .unwrap();
//!
//! let engine = RouteLookupEngine::default();
//! let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("game.example.com");
//! let decision = engine.lookup(&flow, &table);
//!
//! assert_eq!(decision.action, Action::Proxy);
//! assert_eq!(decision.match_level, MatchLevel::Suffix);
//! ```

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::matcher::{match_rule, FlowContext};
use super::table::RouteTable;
use super::types::{
    normalize_domain, Action, FlowProtocol, FlowTime, MatchLevel, NetworkType, RouteDecision,
    RoutingRule, TAG_DIRECT,
};
use crate::cache::{CacheKey, DecisionCache};
use crate::geoip::GeoIpLookup;
use crate::sniff::TrafficSniffer;

/// Flow to be routed
///
/// Uses a builder style for the optional attributes.
///
/// # Example
///
/// ```
/// use routing_core::rules::{FlowDescriptor, FlowProtocol, NetworkType};
///
/// let flow = FlowDescriptor::new(443, FlowProtocol::Tls)
///     .with_ip("203.0.113.7".parse().unwrap())
///     .with_package("com.example.game")
///     .with_network(NetworkType::Wifi);
///
/// assert_eq!(flow.port, 443);
/// assert!(flow.host.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDescriptor {
    /// Destination host, if the caller already knows it
    pub host: Option<String>,

    /// Destination IP address
    pub ip: Option<IpAddr>,

    /// Destination port
    pub port: u16,

    /// Transport/application protocol
    pub protocol: FlowProtocol,

    /// First bytes of the flow, buffered for sniffing
    pub sniff_bytes: Option<Vec<u8>>,

    /// Originating package id
    pub package_id: Option<String>,

    /// Network the device is on
    pub network_type: NetworkType,

    /// Local time of the flow
    pub time: FlowTime,
}

impl FlowDescriptor {
    /// Create a descriptor with only port and protocol set
    ///
    /// The time defaults to now.
    #[must_use]
    pub fn new(port: u16, protocol: FlowProtocol) -> Self {
        Self {
            host: None,
            ip: None,
            port,
            protocol,
            sniff_bytes: None,
            package_id: None,
            network_type: NetworkType::default(),
            time: FlowTime::now(),
        }
    }

    /// Set the destination host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the destination IP.
    #[must_use]
    pub const fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the buffered first bytes.
    #[must_use]
    pub fn with_sniff_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.sniff_bytes = Some(bytes.into());
        self
    }

    /// Set the originating package.
    #[must_use]
    pub fn with_package(mut self, package_id: impl Into<String>) -> Self {
        self.package_id = Some(package_id.into());
        self
    }

    /// Set the network type.
    #[must_use]
    pub const fn with_network(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    /// Set the flow time.
    #[must_use]
    pub const fn with_time(mut self, time: FlowTime) -> Self {
        self.time = time;
        self
    }

    fn bytes(&self) -> Option<&[u8]> {
        self.sniff_bytes.as_deref().filter(|b| !b.is_empty())
    }
}

/// Engine statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total lookups
    pub lookups: AtomicU64,
    /// Lookups answered from the decision cache
    pub cache_hits: AtomicU64,
    /// Cache hits discarded because the table changed since
    pub stale_hits: AtomicU64,
    /// Sniffer invocations
    pub sniffs: AtomicU64,
    /// Sniffer invocations that produced a host
    pub sniff_hosts: AtomicU64,
    /// `GeoIP` queries
    pub geoip_queries: AtomicU64,
    /// Decisions taken from the fallback chain
    pub fallbacks: AtomicU64,
}

impl EngineStats {
    /// Get a snapshot of current stats
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            sniffs: self.sniffs.load(Ordering::Relaxed),
            sniff_hosts: self.sniff_hosts.load(Ordering::Relaxed),
            geoip_queries: self.geoip_queries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Total lookups
    pub lookups: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Stale-version cache hits
    pub stale_hits: u64,
    /// Sniffer invocations
    pub sniffs: u64,
    /// Sniffs that produced a host
    pub sniff_hosts: u64,
    /// `GeoIP` queries
    pub geoip_queries: u64,
    /// Fallback decisions
    pub fallbacks: u64,
}

/// Route lookup engine
///
/// Holds the decision cache, sniffer and `GeoIP` lookup. The route table is
/// passed per call so the caller controls which version is used.
///
/// # Thread Safety
///
/// `lookup` takes `&self` and is safe to call from many threads at once.
#[derive(Debug)]
pub struct RouteLookupEngine {
    cache: DecisionCache,
    sniffer: TrafficSniffer,
    geoip: Arc<GeoIpLookup>,
    hasher: ahash::RandomState,
    stats: EngineStats,
}

impl Default for RouteLookupEngine {
    fn default() -> Self {
        Self::new(
            DecisionCache::default(),
            TrafficSniffer::default(),
            Arc::new(GeoIpLookup::disabled()),
        )
    }
}

impl RouteLookupEngine {
    /// Create an engine from its parts
    #[must_use]
    pub fn new(cache: DecisionCache, sniffer: TrafficSniffer, geoip: Arc<GeoIpLookup>) -> Self {
        Self {
            cache,
            sniffer,
            geoip,
            hasher: ahash::RandomState::new(),
            stats: EngineStats::default(),
        }
    }

    /// Decide the route for a flow
    ///
    /// Never fails: a flow that matches nothing gets the fallback chain.
    pub fn lookup(&self, flow: &FlowDescriptor, table: &RouteTable) -> RouteDecision {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        let key = self.cache_key(flow, table);
        if let Some(key) = &key {
            if let Some(decision) = self.cache.get(key) {
                if decision.table_version == table.version() {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    trace!(port = flow.port, action = %decision.action, "decision cache hit");
                    return decision;
                }
                self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                self.cache.invalidate(key);
            }
        }

        let decision = self.evaluate(flow, table);
        debug!(
            port = flow.port,
            protocol = %flow.protocol,
            action = %decision.action,
            level = %decision.match_level,
            rule = decision.matched_rule_id.as_deref().unwrap_or("-"),
            "route decided"
        );

        if let Some(key) = key {
            self.cache.put(key, decision.clone());
        }
        decision
    }

    /// Cache key for a flow, or `None` if the flow carries nothing to key on
    fn cache_key(&self, flow: &FlowDescriptor, table: &RouteTable) -> Option<CacheKey> {
        let key = if let Some(host) = flow.host.as_deref().filter(|h| !h.is_empty()) {
            CacheKey::host(host, flow.port, flow.protocol)
        } else if let Some(bytes) = flow.bytes() {
            CacheKey::payload(self.hasher.hash_one(bytes), flow.port, flow.protocol)
        } else {
            CacheKey::ip(flow.ip?, flow.port, flow.protocol)
        };
        let key = key
            .with_package(flow.package_id.as_deref())
            .with_network(flow.network_type);
        // Without time rules the hour cannot change a decision
        Some(if table.has_time_rules() {
            key.with_time(flow.time)
        } else {
            key
        })
    }

    fn evaluate(&self, flow: &FlowDescriptor, table: &RouteTable) -> RouteDecision {
        let mut sniffed_host = None;
        if table.sniff_enabled() && flow.protocol.is_stream() {
            if let Some(bytes) = flow.bytes() {
                self.stats.sniffs.fetch_add(1, Ordering::Relaxed);
                let result = self.sniffer.sniff(bytes, flow.port);
                if let Some(host) = result.host {
                    self.stats.sniff_hosts.fetch_add(1, Ordering::Relaxed);
                    sniffed_host = Some(host);
                }
            }
        }

        let host = sniffed_host
            .clone()
            .or_else(|| flow.host.as_deref().map(normalize_domain))
            .filter(|h| !h.is_empty());

        let mut ctx = FlowContext {
            host: host.as_deref(),
            ip: flow.ip,
            port: flow.port,
            protocol: flow.protocol,
            package_id: flow.package_id.as_deref(),
            network_type: flow.network_type,
            time: flow.time,
            country: None,
        };

        let mut deferred: Vec<&RoutingRule> = Vec::new();
        for rule in table.rules_by_priority() {
            if rule.needs_geoip() {
                deferred.push(rule);
                continue;
            }
            if let Some(level) = match_rule(rule, &ctx, table) {
                return Self::rule_decision(rule, level, table, sniffed_host, None);
            }
        }

        let mut country = None;
        if !deferred.is_empty() {
            if let Some(ip) = flow.ip {
                self.stats.geoip_queries.fetch_add(1, Ordering::Relaxed);
                country = self.geoip.lookup_country(ip);
            }
        }

        if let Some(code) = country.as_deref() {
            ctx.country = Some(code);
            for rule in &deferred {
                if match_rule(rule, &ctx, table).is_some() {
                    return Self::rule_decision(
                        rule,
                        MatchLevel::GeoIp,
                        table,
                        sniffed_host,
                        country.clone(),
                    );
                }
            }
        }

        self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
        let (action, tag) = match table.resolve_fallback() {
            Some((action, tag)) => (action, tag.to_string()),
            None => {
                warn!(chain = ?table.fallback_chain(), "fallback chain did not resolve, routing direct");
                (Action::Direct, TAG_DIRECT.to_string())
            }
        };
        RouteDecision {
            action,
            matched_rule_id: None,
            match_level: MatchLevel::Fallback,
            outbound_tag: Some(tag),
            sniffed_host,
            geoip_country: country,
            table_version: table.version(),
            timestamp: Utc::now(),
        }
    }

    fn rule_decision(
        rule: &RoutingRule,
        level: MatchLevel,
        table: &RouteTable,
        sniffed_host: Option<String>,
        geoip_country: Option<String>,
    ) -> RouteDecision {
        RouteDecision {
            action: rule.action.clone(),
            matched_rule_id: Some(rule.id.clone()),
            match_level: level,
            outbound_tag: table.outbound_tag_for(&rule.action),
            sniffed_host,
            geoip_country,
            table_version: table.version(),
            timestamp: Utc::now(),
        }
    }

    /// Drop every cached decision and sniff result
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
        self.sniffer.clear_cache();
    }

    /// Decision cache
    #[must_use]
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// Traffic sniffer
    #[must_use]
    pub fn sniffer(&self) -> &TrafficSniffer {
        &self.sniffer
    }

    /// `GeoIP` lookup
    #[must_use]
    pub fn geoip(&self) -> &Arc<GeoIpLookup> {
        &self.geoip
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}
