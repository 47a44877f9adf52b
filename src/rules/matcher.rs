//! Matcher evaluation against flow attributes
//!
//! Each [`Matcher`] is tested against a borrowed [`FlowContext`]. Domain
//! matchers report the most specific level that resolved the host, which the
//! engine copies into the decision's `match_level`.

use std::net::IpAddr;

use super::table::RouteTable;
use super::types::{FlowProtocol, FlowTime, MatchLevel, Matcher, NetworkType, RoutingRule};

/// Flow attributes visible to matchers
///
/// `host` is already normalized (lowercase, no trailing dot) and is the
/// sniffed host when sniffing succeeded.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext<'a> {
    /// Destination host (sniffed host preferred)
    pub host: Option<&'a str>,
    /// Destination IP
    pub ip: Option<IpAddr>,
    /// Destination port
    pub port: u16,
    /// Transport/application protocol
    pub protocol: FlowProtocol,
    /// Originating package id
    pub package_id: Option<&'a str>,
    /// Current network class
    pub network_type: NetworkType,
    /// Local time of the flow
    pub time: FlowTime,
    /// Destination country, once `GeoIP` has been consulted
    pub country: Option<&'a str>,
}

/// Outcome of testing a single matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Miss,
    Hit,
    Domain(MatchLevel),
}

/// Test a whole rule against a flow
///
/// Returns the match level if every matcher matched: the domain level when
/// the rule has a domain matcher, `GeoIp` when it has a `GeoIP` matcher and
/// no domain matcher, `Rule` otherwise.
#[must_use]
pub fn match_rule(rule: &RoutingRule, ctx: &FlowContext<'_>, table: &RouteTable) -> Option<MatchLevel> {
    let mut domain_level: Option<MatchLevel> = None;
    let mut geo = false;

    for matcher in &rule.matchers {
        match evaluate(matcher, ctx, table) {
            Outcome::Miss => return None,
            Outcome::Hit => {
                if matches!(matcher, Matcher::GeoIp { .. }) {
                    geo = true;
                }
            }
            Outcome::Domain(level) => {
                domain_level = Some(match domain_level {
                    Some(existing) if existing.specificity() <= level.specificity() => existing,
                    _ => level,
                });
            }
        }
    }

    Some(match (domain_level, geo) {
        (Some(level), _) => level,
        (None, true) => MatchLevel::GeoIp,
        (None, false) => MatchLevel::Rule,
    })
}

fn evaluate(matcher: &Matcher, ctx: &FlowContext<'_>, table: &RouteTable) -> Outcome {
    let hit = |b: bool| if b { Outcome::Hit } else { Outcome::Miss };

    match matcher {
        Matcher::App { packages } => {
            hit(ctx.package_id.is_some_and(|p| packages.iter().any(|q| q == p)))
        }
        Matcher::Domain {
            full,
            suffix,
            geosite,
        } => {
            let Some(host) = ctx.host else {
                return Outcome::Miss;
            };
            if full.iter().any(|d| d == host) {
                return Outcome::Domain(MatchLevel::FullDomain);
            }
            if suffix.iter().any(|s| domain_has_suffix(host, s)) {
                return Outcome::Domain(MatchLevel::Suffix);
            }
            let in_geosite = geosite.iter().any(|category| {
                table
                    .geosite(category)
                    .is_some_and(|list| list.iter().any(|s| domain_has_suffix(host, s)))
            });
            if in_geosite {
                Outcome::Domain(MatchLevel::Geosite)
            } else {
                Outcome::Miss
            }
        }
        Matcher::Ip { cidrs } => hit(ctx.ip.is_some_and(|ip| cidrs.iter().any(|n| n.contains(&ip)))),
        Matcher::Port { ranges } => hit(ranges.iter().any(|r| r.contains(ctx.port))),
        Matcher::Protocol { protocols } => hit(protocol_matches(protocols, ctx.protocol)),
        Matcher::GeoIp { countries } => hit(
            ctx.country
                .is_some_and(|c| countries.iter().any(|code| code.eq_ignore_ascii_case(c))),
        ),
        Matcher::Time { hours, weekdays } => {
            let day_ok = weekdays
                .as_ref()
                .map_or(true, |days| days.contains(&ctx.time.weekday));
            hit(day_ok && hours.contains(ctx.time.hour))
        }
        Matcher::NetworkType { networks } => hit(networks.contains(&ctx.network_type)),
    }
}

/// `http` and `tls` flows are TCP flows too
fn protocol_matches(allowed: &[FlowProtocol], actual: FlowProtocol) -> bool {
    allowed.iter().any(|&p| {
        p == actual || (p == FlowProtocol::Tcp && matches!(actual, FlowProtocol::Http | FlowProtocol::Tls))
    })
}

/// Check if `host` equals `suffix` or is a subdomain of it
///
/// Both sides are expected to be normalized. Matching is on label
/// boundaries, so `badexample.com` is not under `example.com`.
///
/// # Examples
///
/// ```
/// use routing_core::rules::matcher::domain_has_suffix;
///
/// assert!(domain_has_suffix("game.example.com", "example.com"));
/// assert!(domain_has_suffix("example.com", "example.com"));
/// assert!(domain_has_suffix("example.com", "com"));
/// assert!(!domain_has_suffix("badexample.com", "example.com"));
/// ```
#[must_use]
pub fn domain_has_suffix(host: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    match host.strip_suffix(suffix) {
        Some("") => true,
        Some(prefix) => prefix.ends_with('.'),
        None => false,
    }
}
