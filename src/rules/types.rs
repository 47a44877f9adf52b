//! Core rule types for the routing engine
//!
//! This module defines the fundamental types for routing rules:
//! - [`RoutingRule`]: A single routing rule (matchers + action)
//! - [`Matcher`]: One matching criterion of a rule
//! - [`Action`]: The terminal routing action of a rule
//! - [`PortRange`] / [`HourRange`]: Range values used by matchers
//! - [`RouteDecision`] / [`MatchLevel`]: The output of a lookup

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Built-in action tags understood by fallback chains and rule configs
pub const TAG_DIRECT: &str = "direct";
/// Built-in proxy tag
pub const TAG_PROXY: &str = "proxy";
/// Built-in block tag
pub const TAG_BLOCK: &str = "block";

/// Terminal routing action
///
/// A matched rule fully determines the decision; there is no chaining.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "outbound", rename_all = "snake_case")]
pub enum Action {
    /// Send through the default proxy outbound
    Proxy,
    /// Connect directly
    Direct,
    /// Drop the flow
    Block,
    /// Send through a named outbound (outbound id)
    CustomProxy(String),
}

impl Action {
    /// Resolve a fallback-chain or config tag to an action
    ///
    /// `direct`, `proxy` and `block` are built in; anything else must be a key
    /// of `outbound_tags`, which maps tags to outbound ids.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use routing_core::rules::Action;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("jp".to_string(), "outbound-7".to_string());
    ///
    /// assert_eq!(Action::from_tag("DIRECT", &tags), Some(Action::Direct));
    /// assert_eq!(
    ///     Action::from_tag("jp", &tags),
    ///     Some(Action::CustomProxy("outbound-7".into()))
    /// );
    /// assert_eq!(Action::from_tag("nowhere", &tags), None);
    /// ```
    #[must_use]
    pub fn from_tag(
        tag: &str,
        outbound_tags: &std::collections::HashMap<String, String>,
    ) -> Option<Self> {
        let tag = tag.trim();
        if tag.eq_ignore_ascii_case(TAG_DIRECT) {
            Some(Self::Direct)
        } else if tag.eq_ignore_ascii_case(TAG_PROXY) {
            Some(Self::Proxy)
        } else if tag.eq_ignore_ascii_case(TAG_BLOCK) {
            Some(Self::Block)
        } else {
            outbound_tags
                .get(tag)
                .map(|id| Self::CustomProxy(id.clone()))
        }
    }

    /// Check if this action drops the flow
    #[must_use]
    pub const fn is_block(&self) -> bool {
        matches!(self, Self::Block)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => write!(f, "{TAG_PROXY}"),
            Self::Direct => write!(f, "{TAG_DIRECT}"),
            Self::Block => write!(f, "{TAG_BLOCK}"),
            Self::CustomProxy(id) => write!(f, "custom:{id}"),
        }
    }
}

/// Transport or application protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    /// Raw TCP stream (application protocol unknown)
    Tcp,
    /// UDP datagrams
    Udp,
    /// Plain HTTP over TCP
    Http,
    /// TLS over TCP
    Tls,
}

impl FlowProtocol {
    /// Parse a protocol name
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidValue` for unknown names.
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "http" => Ok(Self::Http),
            "tls" | "https" => Ok(Self::Tls),
            other => Err(RuleError::InvalidValue(format!("unknown protocol: {other}"))),
        }
    }

    /// Stream protocols can carry sniffable HTTP/TLS first bytes
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp | Self::Http | Self::Tls)
    }

    /// Get protocol name as string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Tls => "tls",
        }
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of the network the device is currently attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Wi-Fi
    Wifi,
    /// Mobile data
    Cellular,
    /// Wired
    Ethernet,
    /// Metered connection of any kind
    Metered,
    /// Unknown or not reported
    #[default]
    Unknown,
}

impl NetworkType {
    /// Parse a network class name
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidValue` for unknown names.
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" | "wlan" => Ok(Self::Wifi),
            "cellular" | "mobile" => Ok(Self::Cellular),
            "ethernet" | "wired" => Ok(Self::Ethernet),
            "metered" => Ok(Self::Metered),
            "unknown" => Ok(Self::Unknown),
            other => Err(RuleError::InvalidValue(format!("unknown network type: {other}"))),
        }
    }
}

/// A range of ports for port-based matching
///
/// Supports both single ports and ranges (e.g., "80" or "80-443").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    /// Start of the range (inclusive)
    pub start: u16,
    /// End of the range (inclusive)
    pub end: u16,
}

impl PortRange {
    /// Create a new port range
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPortRange` if start > end.
    ///
    /// # Examples
    ///
    /// ```
    /// use routing_core::rules::PortRange;
    ///
    /// let range = PortRange::new(80, 443).unwrap();
    /// assert!(range.contains(80));
    /// assert!(range.contains(443));
    /// assert!(!range.contains(8080));
    /// ```
    pub fn new(start: u16, end: u16) -> Result<Self, RuleError> {
        if start > end {
            return Err(RuleError::InvalidPortRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Create a range for a single port
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Check if a port is within this range
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Check if this range represents a single port
    #[must_use]
    pub const fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Parse a port range from a string
    ///
    /// Accepts formats:
    /// - Single port: "80"
    /// - Port range: "80-443"
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if parsing fails or start > end.
    pub fn parse(s: &str) -> Result<Self, RuleError> {
        let s = s.trim();

        if let Some((start_str, end_str)) = s.split_once('-') {
            let start = start_str
                .trim()
                .parse::<u16>()
                .map_err(|_| RuleError::InvalidValue(format!("invalid port number: {start_str}")))?;
            let end = end_str
                .trim()
                .parse::<u16>()
                .map_err(|_| RuleError::InvalidValue(format!("invalid port number: {end_str}")))?;

            Self::new(start, end)
        } else {
            let port = s
                .parse::<u16>()
                .map_err(|_| RuleError::InvalidValue(format!("invalid port number: {s}")))?;
            Ok(Self::single(port))
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Inclusive hour-of-day range, wrapping past midnight when `start > end`
///
/// `22-6` covers 22:00 through 06:59.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourRange {
    /// First hour (0-23)
    pub start: u8,
    /// Last hour (0-23, inclusive)
    pub end: u8,
}

impl HourRange {
    /// Create a new hour range
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidValue` if either bound is above 23.
    pub fn new(start: u8, end: u8) -> Result<Self, RuleError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    fn validate(&self) -> Result<(), RuleError> {
        if self.start > 23 || self.end > 23 {
            return Err(RuleError::InvalidValue(format!(
                "hour range out of bounds: {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Check if an hour falls in the range
    #[must_use]
    pub const fn contains(&self, hour: u8) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour <= self.end
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// Local time attributes of a flow used by `Time` matchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTime {
    /// Hour of day (0-23)
    pub hour: u8,
    /// Day of week
    pub weekday: Weekday,
}

impl FlowTime {
    /// Current local time
    #[must_use]
    pub fn now() -> Self {
        let now = chrono::Local::now();
        Self {
            // hour() is always < 24
            hour: now.hour() as u8,
            weekday: now.weekday(),
        }
    }

    /// Build from explicit values
    #[must_use]
    pub const fn new(hour: u8, weekday: Weekday) -> Self {
        Self { hour, weekday }
    }
}

impl Default for FlowTime {
    fn default() -> Self {
        Self::now()
    }
}

/// One matching criterion of a rule
///
/// A rule matches a flow iff all of its matchers match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    /// Package / bundle identifiers of the originating app
    App { packages: Vec<String> },

    /// Domain patterns: exact names, suffixes, and geosite categories
    Domain {
        #[serde(default)]
        full: Vec<String>,
        #[serde(default)]
        suffix: Vec<String>,
        #[serde(default)]
        geosite: Vec<String>,
    },

    /// Destination CIDR ranges
    Ip { cidrs: Vec<IpNet> },

    /// Destination port ranges
    Port { ranges: Vec<PortRange> },

    /// Transport protocols
    Protocol { protocols: Vec<FlowProtocol> },

    /// Destination country codes (ISO 3166 alpha-2)
    #[serde(rename = "geoip")]
    GeoIp { countries: Vec<String> },

    /// Local time window with optional weekday restriction
    Time {
        hours: HourRange,
        #[serde(default)]
        weekdays: Option<Vec<Weekday>>,
    },

    /// Network classes (wifi, cellular, ...)
    NetworkType { networks: Vec<NetworkType> },
}

impl Matcher {
    /// Domain matcher from suffix patterns only
    pub fn domain_suffix<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Domain {
            full: Vec::new(),
            suffix: suffixes.into_iter().map(Into::into).collect(),
            geosite: Vec::new(),
        }
    }

    /// Domain matcher from exact names only
    pub fn domain_full<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Domain {
            full: names.into_iter().map(Into::into).collect(),
            suffix: Vec::new(),
            geosite: Vec::new(),
        }
    }

    /// Short name of the matcher kind, used in logs and errors
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::App { .. } => "app",
            Self::Domain { .. } => "domain",
            Self::Ip { .. } => "ip",
            Self::Port { .. } => "port",
            Self::Protocol { .. } => "protocol",
            Self::GeoIp { .. } => "geoip",
            Self::Time { .. } => "time",
            Self::NetworkType { .. } => "network_type",
        }
    }

    /// Check that the matcher is well formed
    fn validate(&self, rule_id: &str) -> Result<(), RuleError> {
        let empty = match self {
            Self::App { packages } => packages.is_empty(),
            Self::Domain {
                full,
                suffix,
                geosite,
            } => full.is_empty() && suffix.is_empty() && geosite.is_empty(),
            Self::Ip { cidrs } => cidrs.is_empty(),
            Self::Port { ranges } => ranges.is_empty(),
            Self::Protocol { protocols } => protocols.is_empty(),
            Self::GeoIp { countries } => countries.is_empty(),
            Self::Time { weekdays, .. } => weekdays.as_ref().is_some_and(Vec::is_empty),
            Self::NetworkType { networks } => networks.is_empty(),
        };
        if empty {
            return Err(RuleError::invalid_matcher(
                rule_id,
                format!("{} matcher has an empty set", self.kind()),
            ));
        }

        match self {
            Self::Domain { full, suffix, .. } => {
                for name in full.iter().chain(suffix) {
                    if normalize_domain(name).is_empty() {
                        return Err(RuleError::invalid_matcher(
                            rule_id,
                            format!("invalid domain pattern: {name:?}"),
                        ));
                    }
                }
            }
            Self::Port { ranges } => {
                for range in ranges {
                    if range.start > range.end {
                        return Err(RuleError::InvalidPortRange {
                            start: range.start,
                            end: range.end,
                        });
                    }
                }
            }
            Self::GeoIp { countries } => {
                for code in countries {
                    let code = code.trim();
                    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                        return Err(RuleError::invalid_matcher(
                            rule_id,
                            format!("GeoIP country code must be 2 letters: {code}"),
                        ));
                    }
                }
            }
            Self::Time { hours, .. } => hours.validate()?,
            Self::App { packages } => {
                if packages.iter().any(|p| p.trim().is_empty()) {
                    return Err(RuleError::invalid_matcher(rule_id, "empty package id"));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Canonical form: lowercase domains, uppercase country codes, deduped sets
    fn normalized(self) -> Self {
        match self {
            Self::Domain {
                full,
                suffix,
                geosite,
            } => Self::Domain {
                full: dedup(full.iter().map(|d| normalize_domain(d))),
                suffix: dedup(suffix.iter().map(|d| normalize_domain(d))),
                geosite: dedup(geosite.iter().map(|c| c.trim().to_ascii_lowercase())),
            },
            Self::GeoIp { countries } => Self::GeoIp {
                countries: dedup(countries.iter().map(|c| c.trim().to_ascii_uppercase())),
            },
            Self::App { packages } => Self::App {
                packages: dedup(packages.iter().map(|p| p.trim().to_string())),
            },
            other => other,
        }
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(item.clone())).collect()
}

/// Normalize a host or domain pattern for comparison
///
/// Lowercases, trims whitespace, and strips leading and trailing dots, so
/// `".Example.COM."` becomes `"example.com"`.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .trim_matches('.')
        .to_ascii_lowercase()
}

/// A single routing rule
///
/// Rules are matched against flow metadata to determine the routing action.
/// Immutable once constructed; editing a rule means replacing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Unique identifier for this rule
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Whether this rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Priority (higher values win; ties keep declaration order)
    #[serde(default)]
    pub priority: i32,

    /// All of these must match
    pub matchers: Vec<Matcher>,

    /// What to do with a matching flow
    pub action: Action,
}

const fn default_true() -> bool {
    true
}

impl RoutingRule {
    /// Create a new enabled rule with priority 0
    ///
    /// # Examples
    ///
    /// ```
    /// use routing_core::rules::{Action, Matcher, RoutingRule};
    ///
    /// let rule = RoutingRule::new("r1", vec![Matcher::domain_suffix([".example.com"])], Action::Proxy)
    ///     .with_priority(10);
    /// assert_eq!(rule.priority, 10);
    /// assert!(rule.enabled);
    /// ```
    #[must_use]
    pub fn new(id: impl Into<String>, matchers: Vec<Matcher>, action: Action) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            priority: 0,
            matchers,
            action,
        }
    }

    /// Set the priority for this rule
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the enabled state for this rule
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the display name for this rule
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validate this rule on its own (table-independent checks)
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if:
    /// - The id is empty
    /// - The rule has no matchers
    /// - Any matcher is malformed
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::EmptyId);
        }

        if self.matchers.is_empty() {
            return Err(RuleError::NoMatchers {
                id: self.id.clone(),
            });
        }

        for matcher in &self.matchers {
            matcher.validate(&self.id)?;
        }

        if let Action::CustomProxy(outbound) = &self.action {
            if outbound.trim().is_empty() {
                return Err(RuleError::UnknownOutbound {
                    id: self.id.clone(),
                    outbound: outbound.clone(),
                });
            }
        }

        Ok(())
    }

    /// Validate and return the canonical form of this rule
    pub(crate) fn into_normalized(self) -> Result<Self, RuleError> {
        self.validate()?;
        Ok(Self {
            matchers: self.matchers.into_iter().map(Matcher::normalized).collect(),
            ..self
        })
    }

    /// Whether evaluation of this rule needs a `GeoIP` country
    #[must_use]
    pub fn needs_geoip(&self) -> bool {
        self.matchers
            .iter()
            .any(|m| matches!(m, Matcher::GeoIp { .. }))
    }

    /// Whether this rule constrains the destination domain
    #[must_use]
    pub fn has_domain_matcher(&self) -> bool {
        self.matchers
            .iter()
            .any(|m| matches!(m, Matcher::Domain { .. }))
    }
}

/// Which kind of criterion resolved a decision
///
/// Ordered from most to least specific for domain resolution:
/// `FullDomain` > `Suffix` > `Geosite` > `GeoIp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLevel {
    /// Exact domain name
    FullDomain,
    /// Domain suffix
    Suffix,
    /// Geosite category
    Geosite,
    /// Destination country
    GeoIp,
    /// Rule matched on non-domain criteria only (app, port, IP, ...)
    Rule,
    /// No rule matched; fallback chain used
    Fallback,
}

impl MatchLevel {
    /// Rank for picking the most specific domain level (lower is better)
    #[must_use]
    pub const fn specificity(&self) -> u8 {
        match self {
            Self::FullDomain => 0,
            Self::Suffix => 1,
            Self::Geosite => 2,
            Self::GeoIp => 3,
            Self::Rule => 4,
            Self::Fallback => 5,
        }
    }
}

impl fmt::Display for MatchLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullDomain => "full_domain",
            Self::Suffix => "suffix",
            Self::Geosite => "geosite",
            Self::GeoIp => "geoip",
            Self::Rule => "rule",
            Self::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Result of a route lookup
///
/// Produced once per cache miss and never modified afterwards; cache hits
/// return an identical clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// What to do with the flow
    pub action: Action,

    /// Id of the rule that matched (`None` for fallback)
    pub matched_rule_id: Option<String>,

    /// Which criterion resolved the decision
    pub match_level: MatchLevel,

    /// Outbound tag the action maps to
    pub outbound_tag: Option<String>,

    /// Host extracted by the sniffer, if any
    pub sniffed_host: Option<String>,

    /// Destination country, if `GeoIP` was consulted and answered
    pub geoip_country: Option<String>,

    /// Version of the route table that produced this decision
    pub table_version: u64,

    /// When the decision was computed
    pub timestamp: DateTime<Utc>,
}

impl RouteDecision {
    /// Check if this decision came from the fallback chain
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.match_level == MatchLevel::Fallback
    }
}
