//! Lookup pipeline integration tests
//!
//! Exercises the whole decision path: decision cache, sniffing, priority
//! rules, deferred `GeoIP` rules and the fallback chain.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use routing_core::cache::DecisionCache;
use routing_core::coordinator::RoutingCoordinator;
use routing_core::geoip::{CountryDatabase, GeoIpLookup, StaticSource};
use routing_core::rules::{
    Action, FlowDescriptor, FlowProtocol, MatchLevel, Matcher, PortRange, RouteLookupEngine,
    RouteTable, RoutingRule,
};
use routing_core::sniff::{sniff_payload, SniffProtocol, TrafficSniffer};

use super::{client_hello, suffix_rule};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn geoip_engine() -> RouteLookupEngine {
    let mut db = CountryDatabase::new();
    db.insert("203.0.113.0/24".parse().unwrap(), "jp").unwrap();
    db.insert("198.51.100.0/24".parse().unwrap(), "us").unwrap();
    RouteLookupEngine::new(
        DecisionCache::default(),
        TrafficSniffer::default(),
        Arc::new(GeoIpLookup::new(Arc::new(StaticSource(Arc::new(db))), 100)),
    )
}

// ============================================================================
// Decision Guarantees
// ============================================================================

#[test]
fn test_every_flow_gets_a_decision() {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flows = [
        FlowDescriptor::new(443, FlowProtocol::Tcp),
        FlowDescriptor::new(53, FlowProtocol::Udp).with_ip(ip("9.9.9.9")),
        FlowDescriptor::new(80, FlowProtocol::Http).with_sniff_bytes(vec![0u8; 3]),
        FlowDescriptor::new(443, FlowProtocol::Tls).with_host(""),
        FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("unmapped.example"),
    ];

    for flow in &flows {
        let decision = engine.lookup(flow, &table);
        assert_eq!(decision.action, Action::Direct, "flow {flow:?}");
        assert!(decision.is_fallback());
        assert_eq!(decision.table_version, table.version());
    }
}

#[test]
fn test_unmapped_host_uses_fallback_chain() {
    let table = RouteTable::builder()
        .fallback_chain(vec!["direct".into(), "proxy".into()])
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("unmapped.example");
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.action, Action::Direct);
    assert_eq!(decision.match_level, MatchLevel::Fallback);
    assert_eq!(decision.matched_rule_id, None);
    assert_eq!(decision.outbound_tag.as_deref(), Some("direct"));
}

#[test]
fn test_higher_priority_rule_wins() {
    let table = RouteTable::builder()
        .rule(suffix_rule("low", "example.com", Action::Proxy).with_priority(50))
        .rule(suffix_rule("high", "example.com", Action::Block).with_priority(100))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("cdn.example.com");
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.action, Action::Block);
    assert_eq!(decision.matched_rule_id.as_deref(), Some("high"));
}

#[test]
fn test_equal_priority_keeps_declaration_order() {
    let table = RouteTable::builder()
        .rule(suffix_rule("first", "example.com", Action::Proxy).with_priority(10))
        .rule(suffix_rule("second", "example.com", Action::Block).with_priority(10))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");
    assert_eq!(
        engine.lookup(&flow, &table).matched_rule_id.as_deref(),
        Some("first")
    );
}

#[test]
fn test_disabled_rule_skipped() {
    let table = RouteTable::builder()
        .rule(suffix_rule("off", "example.com", Action::Block).with_enabled(false))
        .rule(suffix_rule("on", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("example.com");
    assert_eq!(engine.lookup(&flow, &table).matched_rule_id.as_deref(), Some("on"));
}

#[test]
fn test_multi_matcher_rule_needs_all() {
    let table = RouteTable::builder()
        .rule(RoutingRule::new(
            "game-udp",
            vec![
                Matcher::App {
                    packages: vec!["com.example.game".into()],
                },
                Matcher::Port {
                    ranges: vec![PortRange::new(7000, 7100).unwrap()],
                },
            ],
            Action::Proxy,
        ))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let hit = FlowDescriptor::new(7050, FlowProtocol::Udp)
        .with_ip(ip("192.0.2.10"))
        .with_package("com.example.game");
    let wrong_port = FlowDescriptor::new(8000, FlowProtocol::Udp)
        .with_ip(ip("192.0.2.10"))
        .with_package("com.example.game");
    let wrong_app = FlowDescriptor::new(7050, FlowProtocol::Udp)
        .with_ip(ip("192.0.2.10"))
        .with_package("com.example.browser");

    assert_eq!(engine.lookup(&hit, &table).action, Action::Proxy);
    assert!(engine.lookup(&wrong_port, &table).is_fallback());
    assert!(engine.lookup(&wrong_app, &table).is_fallback());
}

// ============================================================================
// Sniffing
// ============================================================================

#[test]
fn test_sniffed_sni_matches_suffix_rule() {
    let table = RouteTable::builder()
        .rule(suffix_rule("games", ".example.com", Action::Proxy).with_priority(10))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow =
        FlowDescriptor::new(443, FlowProtocol::Tls).with_sniff_bytes(client_hello("game.example.com"));
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.action, Action::Proxy);
    assert_eq!(decision.match_level, MatchLevel::Suffix);
    assert_eq!(decision.sniffed_host.as_deref(), Some("game.example.com"));
}

#[test]
fn test_sniffed_host_independent_of_ip() {
    let table = RouteTable::builder()
        .rule(suffix_rule("com", ".com", Action::Proxy))
        .rule(
            RoutingRule::new(
                "lan",
                vec![Matcher::Ip {
                    cidrs: vec!["198.51.100.0/24".parse().unwrap()],
                }],
                Action::Direct,
            )
            .with_priority(-10),
        )
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp)
        .with_ip(ip("198.51.100.20"))
        .with_sniff_bytes(client_hello("example.com"));
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.sniffed_host.as_deref(), Some("example.com"));
    assert_eq!(decision.match_level, MatchLevel::Suffix);
    assert_eq!(decision.matched_rule_id.as_deref(), Some("com"));
}

#[test]
fn test_http_host_sniffed() {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.org", Action::Block))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let request = b"GET / HTTP/1.1\r\nHost: www.example.org:8080\r\nUser-Agent: test\r\n\r\n";
    let flow = FlowDescriptor::new(8080, FlowProtocol::Tcp).with_sniff_bytes(request.to_vec());
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.action, Action::Block);
    assert_eq!(decision.sniffed_host.as_deref(), Some("www.example.org"));
}

#[test]
fn test_truncated_tls_falls_back() {
    let truncated = [0x16, 0x03, 0x01, 0x00, 0x40];

    let result = sniff_payload(&truncated, 443);
    assert!(!result.success);
    assert_eq!(result.host, None);
    assert_eq!(result.protocol, SniffProtocol::Tls);

    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();
    let flow = FlowDescriptor::new(443, FlowProtocol::Tls).with_sniff_bytes(truncated.to_vec());
    let decision = engine.lookup(&flow, &table);

    assert!(decision.is_fallback());
    assert_eq!(decision.action, Action::Direct);
    assert_eq!(decision.sniffed_host, None);
}

#[test]
fn test_sniff_disabled_table_ignores_payload() {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .sniff_enabled(false)
        .build()
        .unwrap();
    let engine = RouteLookupEngine::default();

    let flow =
        FlowDescriptor::new(443, FlowProtocol::Tls).with_sniff_bytes(client_hello("www.example.com"));
    let decision = engine.lookup(&flow, &table);

    assert!(decision.is_fallback());
    assert_eq!(engine.stats().snapshot().sniffs, 0);
}

// ============================================================================
// Decision Cache
// ============================================================================

#[test]
fn test_cached_decision_identical_and_skips_sniff_and_geoip() {
    let table = RouteTable::builder()
        .rule(RoutingRule::new(
            "jp",
            vec![Matcher::GeoIp {
                countries: vec!["JP".into()],
            }],
            Action::Proxy,
        ))
        .build()
        .unwrap();
    let engine = geoip_engine();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tls)
        .with_ip(ip("203.0.113.50"))
        .with_sniff_bytes(client_hello("unlisted.example.net"));

    let first = engine.lookup(&flow, &table);
    let after_first = engine.stats().snapshot();
    let second = engine.lookup(&flow, &table);
    let after_second = engine.stats().snapshot();

    assert_eq!(first, second);
    assert_eq!(first.match_level, MatchLevel::GeoIp);
    assert_eq!(first.geoip_country.as_deref(), Some("JP"));

    assert_eq!(after_second.cache_hits, after_first.cache_hits + 1);
    assert_eq!(after_second.sniffs, after_first.sniffs);
    assert_eq!(after_second.geoip_queries, after_first.geoip_queries);
}

#[test]
fn test_cached_decision_expires() {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let engine = RouteLookupEngine::new(
        DecisionCache::new(100, Duration::from_millis(50)),
        TrafficSniffer::default(),
        Arc::new(GeoIpLookup::disabled()),
    );

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");
    engine.lookup(&flow, &table);
    engine.lookup(&flow, &table);
    assert_eq!(engine.stats().snapshot().cache_hits, 1);

    thread::sleep(Duration::from_millis(120));

    engine.lookup(&flow, &table);
    let stats = engine.stats().snapshot();
    assert_eq!(stats.lookups, 3);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn test_decision_from_old_table_not_served() {
    let engine = RouteLookupEngine::default();
    let old = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let new = old
        .with_rule_updated(suffix_rule("ex", "example.com", Action::Block))
        .unwrap();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");
    assert_eq!(engine.lookup(&flow, &old).action, Action::Proxy);
    assert_eq!(engine.lookup(&flow, &new).action, Action::Block);
    assert_eq!(engine.stats().snapshot().stale_hits, 1);
}

#[test]
fn test_reconnect_empties_cache_keeps_table() {
    let coordinator = RoutingCoordinator::standalone(
        RouteTable::builder()
            .rule(suffix_rule("ex", "example.com", Action::Proxy))
            .build()
            .unwrap(),
    );
    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("www.example.com");

    coordinator.route(&flow);
    assert_eq!(coordinator.engine().cache().len(), 1);
    let before = coordinator.current_route_table();

    coordinator.on_binder_reconnected();

    assert!(coordinator.engine().cache().is_empty());
    assert!(Arc::ptr_eq(&before, &coordinator.current_route_table()));

    let hits = coordinator.engine().stats().snapshot().cache_hits;
    assert_eq!(coordinator.route(&flow).action, Action::Proxy);
    assert_eq!(coordinator.engine().stats().snapshot().cache_hits, hits);
}

// ============================================================================
// GeoIP
// ============================================================================

#[test]
fn test_domain_rule_beats_geoip_rule() {
    let table = RouteTable::builder()
        .rule(RoutingRule::new(
            "us",
            vec![Matcher::GeoIp {
                countries: vec!["US".into()],
            }],
            Action::Proxy,
        ))
        .rule(suffix_rule("local", "example.com", Action::Direct))
        .build()
        .unwrap();
    let engine = geoip_engine();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp)
        .with_host("www.example.com")
        .with_ip(ip("198.51.100.7"));
    let decision = engine.lookup(&flow, &table);

    assert_eq!(decision.matched_rule_id.as_deref(), Some("local"));
    assert_eq!(engine.stats().snapshot().geoip_queries, 0);
}

#[test]
fn test_geoip_not_queried_without_country_rules() {
    let table = RouteTable::builder()
        .rule(suffix_rule("ex", "example.com", Action::Proxy))
        .build()
        .unwrap();
    let engine = geoip_engine();

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_ip(ip("203.0.113.1"));
    let decision = engine.lookup(&flow, &table);

    assert!(decision.is_fallback());
    assert_eq!(decision.geoip_country, None);
    assert_eq!(engine.stats().snapshot().geoip_queries, 0);
    assert_eq!(engine.geoip().cached_queries(), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_lookups_during_table_edits() {
    let coordinator = Arc::new(RoutingCoordinator::standalone(RouteTable::empty()));

    let readers: Vec<_> = (0..4)
        .map(|t| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                for i in 0..200 {
                    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp)
                        .with_host(format!("host{}.t{t}.example.com", i % 20));
                    let decision = coordinator.route(&flow);
                    assert!(matches!(decision.action, Action::Direct | Action::Proxy));
                }
            })
        })
        .collect();

    for i in 0..50 {
        coordinator
            .add_rule(suffix_rule(&format!("r{i}"), &format!("t{}.example.com", i % 4), Action::Proxy))
            .unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }

    let table = coordinator.current_route_table();
    assert_eq!(table.len(), 50);

    let flow = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("host1.t2.example.com");
    let decision = coordinator.route(&flow);
    assert_eq!(decision.action, Action::Proxy);
    assert_eq!(decision.table_version, table.version());
}
