//! Configuration and `GeoIP` database integration tests
//!
//! Configuration files and country databases are written to temporary
//! directories and loaded through the public loaders.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use routing_core::config::{apply_env_overrides, load_config, ENV_GEOIP_PATH};
use routing_core::coordinator::CoordinatorState;
use routing_core::geoip::GeoIpStatus;
use routing_core::rules::{Action, FlowDescriptor, FlowProtocol, MatchLevel};

fn write_database(path: &Path, code: &str) {
    let json = format!(
        r#"{{
            "countries": [
                {{ "code": "{code}", "name": "Test", "ipv4_ranges": ["203.0.113.0/24"],
                   "ipv6_ranges": ["2001:db8::/32"] }},
                {{ "code": "us", "ipv4_ranges": ["198.51.100.0/24"] }}
            ]
        }}"#
    );
    fs::write(path, json).unwrap();
}

fn write_config(dir: &Path, geoip: &Path) -> std::path::PathBuf {
    let json = format!(
        r#"{{
            "log": {{ "level": "debug", "format": "text" }},
            "routing": {{
                "fallback_chain": ["jp", "direct"],
                "outbound_tags": {{ "jp": "wg-tokyo" }},
                "geosite": {{ "games": ["game.example"] }},
                "rules": [
                    {{
                        "id": "ads",
                        "priority": 100,
                        "matchers": [{{ "type": "domain", "suffix": ["ads.example"] }}],
                        "action": {{ "type": "block" }}
                    }},
                    {{
                        "id": "games",
                        "priority": 50,
                        "matchers": [{{ "type": "domain", "geosite": ["games"] }}],
                        "action": {{ "type": "proxy" }}
                    }},
                    {{
                        "id": "jp-ip",
                        "matchers": [{{ "type": "geoip", "countries": ["JP"] }}],
                        "action": {{ "type": "custom_proxy", "outbound": "wg-tokyo" }}
                    }},
                    {{
                        "id": "kr-ip",
                        "matchers": [{{ "type": "geoip", "countries": ["KR"] }}],
                        "action": {{ "type": "block" }}
                    }}
                ]
            }},
            "cache": {{ "ttl_secs": 30, "max_entries": 5000 }},
            "geoip": {{ "database_path": {geoip:?} }}
        }}"#
    );
    let path = dir.join("config.json");
    fs::write(&path, json).unwrap();
    path
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_config_file_drives_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("geoip.json");
    write_database(&db, "jp");
    let config = load_config(write_config(dir.path(), &db)).unwrap();

    let table = config.build_table().unwrap();
    let engine = config.build_engine();
    assert_eq!(table.len(), 4);
    assert_eq!(engine.cache().capacity(), 5000);

    let ads = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("tracker.ads.example");
    assert_eq!(engine.lookup(&ads, &table).action, Action::Block);

    let game = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("eu.game.example");
    let decision = engine.lookup(&game, &table);
    assert_eq!(decision.action, Action::Proxy);
    assert_eq!(decision.match_level, MatchLevel::Geosite);

    // Unmatched: first fallback entry resolves through the outbound tag map
    let other = FlowDescriptor::new(443, FlowProtocol::Tcp).with_host("unmapped.example");
    let decision = engine.lookup(&other, &table);
    assert!(decision.is_fallback());
    assert_eq!(decision.action, Action::CustomProxy("wg-tokyo".into()));
    assert_eq!(decision.outbound_tag.as_deref(), Some("jp"));
}

#[test]
fn test_geoip_database_loaded_lazily() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("geoip.json");
    write_database(&db, "jp");
    let config = load_config(write_config(dir.path(), &db)).unwrap();

    let table = config.build_table().unwrap();
    let engine = config.build_engine();
    assert_eq!(engine.geoip().status(), GeoIpStatus::NotLoaded);

    // Domain match needs no country
    let game = FlowDescriptor::new(443, FlowProtocol::Tcp)
        .with_host("eu.game.example")
        .with_ip(ip("203.0.113.10"));
    engine.lookup(&game, &table);
    assert_eq!(engine.geoip().status(), GeoIpStatus::NotLoaded);

    let tokyo = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("203.0.113.10"));
    let decision = engine.lookup(&tokyo, &table);
    assert_eq!(decision.action, Action::CustomProxy("wg-tokyo".into()));
    assert_eq!(decision.match_level, MatchLevel::GeoIp);
    assert_eq!(decision.matched_rule_id.as_deref(), Some("jp-ip"));
    assert_eq!(decision.geoip_country.as_deref(), Some("JP"));
    assert_eq!(decision.outbound_tag.as_deref(), Some("jp"));
    assert!(matches!(engine.geoip().status(), GeoIpStatus::Loaded { ranges: 3 }));

    let v6 = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("2001:db8::1"));
    assert_eq!(engine.lookup(&v6, &table).matched_rule_id.as_deref(), Some("jp-ip"));
}

#[test]
fn test_missing_database_degrades_to_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(write_config(dir.path(), &dir.path().join("absent.json"))).unwrap();

    let table = config.build_table().unwrap();
    let engine = config.build_engine();

    let flow = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("203.0.113.10"));
    let decision = engine.lookup(&flow, &table);

    assert!(decision.is_fallback());
    assert_eq!(decision.geoip_country, None);
    assert_eq!(engine.geoip().status(), GeoIpStatus::Unavailable);

    // Failure is remembered: no second load attempt
    let again = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("203.0.113.11"));
    engine.lookup(&again, &table);
    assert_eq!(engine.geoip().stats().snapshot().load_failures, 1);
}

#[test]
fn test_config_reload_picks_up_new_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("geoip.json");
    write_database(&db, "jp");
    let config = load_config(write_config(dir.path(), &db)).unwrap();
    let coordinator = config.build_coordinator().unwrap();

    let flow = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("203.0.113.10"));
    assert_eq!(coordinator.route(&flow).matched_rule_id.as_deref(), Some("jp-ip"));

    write_database(&db, "kr");
    // Cached until the reload
    assert_eq!(coordinator.route(&flow).matched_rule_id.as_deref(), Some("jp-ip"));

    coordinator.on_config_reload();

    let decision = coordinator.route(&flow);
    assert_eq!(decision.matched_rule_id.as_deref(), Some("kr-ip"));
    assert_eq!(decision.action, Action::Block);
    assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);
}

#[test]
fn test_env_override_points_at_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("override.json");
    write_database(&db, "jp");
    let config = load_config(write_config(dir.path(), &dir.path().join("absent.json"))).unwrap();

    let db_path = db.to_string_lossy().into_owned();
    let config = apply_env_overrides(config, |name| {
        (name == ENV_GEOIP_PATH).then(|| db_path.clone())
    })
    .unwrap();

    let table = config.build_table().unwrap();
    let engine = config.build_engine();
    let flow = FlowDescriptor::new(443, FlowProtocol::Udp).with_ip(ip("203.0.113.10"));
    assert_eq!(engine.lookup(&flow, &table).geoip_country.as_deref(), Some("JP"));
}
