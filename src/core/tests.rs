//! Compile scenarios across store, resolver and compiler

use crate::core::compiler::{Clock, WarningKind, compile};
use crate::core::identity::DirectorySnapshot;
use crate::core::rules::{Client, Config, Destination, Protocol};
use crate::core::schedule::{DaySet, TimeWindow};
use crate::core::test_helpers::{
    block_rule, clock_at, forward_rule, group_rule, sample_directory, site_forward_rule, site_vpn,
    tag_rule,
};
use serde_json::{Value, json};

fn elements(config: &Config, map: &str) -> Vec<(Value, Value)> {
    compile(config, &sample_directory(), clock_at(12, 0))
        .maps
        .get(map)
        .map(|m| m.elements.clone())
        .unwrap_or_default()
}

fn key(parts: Value) -> Value {
    json!({ "concat": parts })
}

// ═══════════════════════════════════════════════════════════════════════════
// Forwarding
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_dnat_maps_stay_in_lock_step() {
    let config = Config {
        forwarding_rules: vec![forward_rule("", "192.168.1.10", "80", "192.168.2.20")],
        ..Config::default()
    };

    let ipmap = elements(&config, "dnat_tcp_ipmap");
    let portmap = elements(&config, "dnat_tcp_portmap");
    assert_eq!(ipmap.len(), 1);
    assert_eq!(portmap.len(), 1);

    let expected_key = key(json!(["0.0.0.0", "192.168.1.10", 80]));
    assert_eq!(ipmap[0].0, expected_key);
    assert_eq!(portmap[0].0, expected_key);
    assert_eq!(ipmap[0].1, json!("192.168.2.20"));
    assert_eq!(portmap[0].1, json!(80));

    assert!(elements(&config, "dnat_udp_ipmap").is_empty());
}

#[test]
fn test_dnat_port_range_rewrites_to_single_port() {
    let mut rule = forward_rule("range", "192.168.1.10", "8000-8080", "192.168.2.20");
    rule.dst_port = "9000".to_string();
    rule.protocol = Some(Protocol::Udp);
    let config = Config {
        forwarding_rules: vec![rule],
        ..Config::default()
    };

    let ipmap = elements(&config, "dnat_udp_ipmap");
    let portmap = elements(&config, "dnat_udp_portmap");
    assert_eq!(
        ipmap[0].0,
        key(json!(["0.0.0.0", "192.168.1.10", {"range": [8000, 8080]}]))
    );
    assert_eq!(ipmap[0].0, portmap[0].0);
    assert_eq!(portmap[0].1, json!(9000));
}

#[test]
fn test_interface_forward_fills_filter_and_mangle() {
    let config = Config {
        forwarding_rules: vec![site_forward_rule("mitm", "10.0.0.5", "443", "mitmproxy0")],
        ..Config::default()
    };

    let filter = elements(&config, "site_forward_tcp_port");
    let mangle = elements(&config, "site_forward_tcp_port_mangle");
    assert_eq!(
        filter,
        vec![(
            key(json!(["0.0.0.0", "10.0.0.5", 443, "mitmproxy0"])),
            json!({"accept": null})
        )]
    );
    assert_eq!(
        mangle,
        vec![(
            key(json!(["0.0.0.0", "10.0.0.5", 443])),
            json!({"accept": null})
        )]
    );
    assert!(elements(&config, "dnat_tcp_ipmap").is_empty());
}

#[test]
fn test_site_interface_needs_matching_vpn() {
    let mut config = Config {
        forwarding_rules: vec![site_forward_rule("to site1", "10.0.0.5", "22", "site1")],
        site_vpns: vec![site_vpn("10.10.0.1/24")],
        ..Config::default()
    };

    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::UnknownInterface);
    assert_eq!(result.warnings[0].bucket, "forward");
    assert_eq!(result.maps.element_count(), 0);

    config.forwarding_rules[0].dst_interface = "site0".to_string();
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert!(result.warnings.is_empty());
    assert_eq!(result.maps.get("site_forward_tcp_port").unwrap().elements.len(), 1);
}

#[test]
fn test_open_interface_forward_covers_both_protocols() {
    let mut rule = site_forward_rule("all via site0", "0.0.0.0", "", "site0");
    rule.protocol = None;
    let config = Config {
        forwarding_rules: vec![rule],
        site_vpns: vec![site_vpn("10.10.0.1/24")],
        ..Config::default()
    };

    let expected = key(json!([
        "0.0.0.0",
        {"prefix": {"addr": "0.0.0.0", "len": 0}},
        {"range": [0, 65535]},
        "site0"
    ]));
    for proto in ["tcp", "udp"] {
        let filter = elements(&config, &format!("site_forward_{proto}_port"));
        assert_eq!(filter, vec![(expected.clone(), json!({"accept": null}))]);
        assert_eq!(elements(&config, &format!("site_forward_{proto}_port_mangle")).len(), 1);
    }
}

#[test]
fn test_domain_destination_never_widens_to_any() {
    let mut rule = block_rule("example.com", "");
    rule.dst = Destination::domain("example.com");
    rule.base.client = Client::src_ip("192.168.2.50");
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };

    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.maps.element_count(), 0);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::InvalidRule);
    assert!(result.warnings[0].message.contains("Domain"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Blocking
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_block_any_source_single_destination() {
    let config = Config {
        block_rules: vec![block_rule("Block TCP test", "1.2.3.4")],
        ..Config::default()
    };
    assert_eq!(
        elements(&config, "pfw_block_tcp"),
        vec![(
            key(json!(["0.0.0.0", "1.2.3.4", {"range": [0, 65535]}])),
            json!({"drop": null})
        )]
    );
}

#[test]
fn test_block_any_destination_covers_everything() {
    let mut rule = block_rule("everything", "0.0.0.0/0");
    rule.base.client = Client::src_ip("192.168.3.0/24");
    rule.dst_port = "53".to_string();
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    assert_eq!(
        elements(&config, "pfw_block_tcp")[0].0,
        key(json!([
            {"prefix": {"addr": "192.168.3.0", "len": 24}},
            {"prefix": {"addr": "0.0.0.0", "len": 0}},
            53
        ]))
    );
}

#[test]
fn test_first_rule_wins_on_duplicate_key() {
    let config = Config {
        block_rules: vec![block_rule("first", "1.2.3.4"), block_rule("second", "1.2.3.4")],
        ..Config::default()
    };
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.maps.get("pfw_block_tcp").unwrap().elements.len(), 1);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].kind, WarningKind::DuplicateKey);
    assert_eq!(result.warnings[0].index, 1);
    assert_eq!(result.warnings[0].rule, "second");
}

#[test]
fn test_group_client_expands_to_members() {
    let mut rule = block_rule("lan", "1.2.3.4");
    rule.base.client = Client::group("lan");
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    let sources: Vec<Value> = elements(&config, "pfw_block_tcp")
        .into_iter()
        .map(|(k, _)| k["concat"][0].clone())
        .collect();
    assert_eq!(sources, vec![json!("192.168.2.10"), json!("192.168.2.20")]);
}

#[test]
fn test_unresolved_client_is_a_warning() {
    let mut rule = block_rule("ghost", "1.2.3.4");
    rule.base.client = Client::identity("ghost");
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.maps.element_count(), 0);
    assert_eq!(result.warnings[0].kind, WarningKind::NoMatchingClients);

    // Once the device shows up the same rule compiles
    let mut directory = sample_directory();
    if let Some(device) = directory.devices.get_mut("AA:BB:CC:DD:EE:01") {
        device.name = "ghost".to_string();
    }
    let result = compile(&config, &directory, clock_at(12, 0));
    assert_eq!(result.maps.element_count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Dynamic membership
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_tag_rule_grants_tag_to_clients() {
    let mut block = block_rule("kids", "1.2.3.4");
    block.base.client = Client::tag("kids");
    let config = Config {
        tag_rules: vec![tag_rule("laptop is kids", Client::identity("laptop"), &["kids"])],
        block_rules: vec![block],
        ..Config::default()
    };
    assert_eq!(elements(&config, "pfw_block_tcp").len(), 2);
}

#[test]
fn test_group_rule_grants_group_membership() {
    let mut block = block_rule("guests", "1.2.3.4");
    block.base.client = Client::group("guests");
    let config = Config {
        group_rules: vec![group_rule("visitor", Client::src_ip("10.9.9.9"), &["guests"])],
        block_rules: vec![block],
        ..Config::default()
    };
    let elems = elements(&config, "pfw_block_tcp");
    assert_eq!(elems.len(), 1);
    assert_eq!(elems[0].0["concat"][0], json!("10.9.9.9"));
}

#[test]
fn test_inactive_tag_rule_grants_nothing() {
    let mut tag = tag_rule("evenings", Client::identity("laptop"), &["late"]);
    tag.base.time = TimeWindow::new(DaySet::EVERY_DAY, "20:00", "23:00");
    let mut block = block_rule("late", "1.2.3.4");
    block.base.client = Client::tag("late");
    let config = Config {
        tag_rules: vec![tag],
        block_rules: vec![block],
        ..Config::default()
    };
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.maps.element_count(), 0);
    assert_eq!(result.warnings[0].kind, WarningKind::NoMatchingClients);
}

// ═══════════════════════════════════════════════════════════════════════════
// Liveness
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_time_window_gates_rule() {
    let mut rule = block_rule("work hours", "1.2.3.4");
    rule.base.time = TimeWindow::new(DaySet::WEEKDAYS, "09:00", "17:00");
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    let directory = sample_directory();
    assert_eq!(compile(&config, &directory, clock_at(10, 0)).maps.element_count(), 1);
    assert_eq!(compile(&config, &directory, clock_at(18, 0)).maps.element_count(), 0);

    let mut weekend = config.clone();
    weekend.block_rules[0].base.time = TimeWindow::new(DaySet::WEEKEND, "09:00", "17:00");
    assert_eq!(compile(&weekend, &directory, clock_at(10, 0)).maps.element_count(), 0);
}

#[test]
fn test_always_rule_is_unconstrained() {
    let mut rule = block_rule("always", "1.2.3.4");
    rule.base.time = TimeWindow {
        days: vec![0; 7],
        ..TimeWindow::always()
    };
    let config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    let directory = sample_directory();
    for (hour, minute) in [(0, 0), (12, 0), (23, 59)] {
        assert_eq!(
            compile(&config, &directory, clock_at(hour, minute)).maps.element_count(),
            1
        );
    }
}

#[test]
fn test_expired_and_disabled_rules_are_skipped() {
    let mut expired = block_rule("expired", "1.1.1.1");
    expired.base.expiration = 1_749_999_999;
    let mut pending = block_rule("pending", "2.2.2.2");
    pending.base.expiration = 1_750_000_001;
    let mut disabled = block_rule("disabled", "3.3.3.3");
    disabled.base.disabled = true;

    let config = Config {
        block_rules: vec![expired, pending, disabled],
        ..Config::default()
    };
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    let elems = &result.maps.get("pfw_block_tcp").unwrap().elements;
    assert_eq!(elems.len(), 1);
    assert_eq!(elems[0].0["concat"][1], json!("2.2.2.2"));
    assert!(result.warnings.is_empty());
}

#[test]
fn test_condition_uses_variables() {
    let mut rule = block_rule("away", "1.2.3.4");
    rule.base.condition = "mode == 'away'".to_string();
    let mut config = Config {
        block_rules: vec![rule],
        ..Config::default()
    };
    config.variables.insert("mode".into(), "away".into());
    assert_eq!(elements(&config, "pfw_block_tcp").len(), 1);

    config.variables.insert("mode".into(), "home".into());
    assert!(elements(&config, "pfw_block_tcp").is_empty());

    config.variables.clear();
    let result = compile(&config, &sample_directory(), clock_at(12, 0));
    assert_eq!(result.warnings[0].kind, WarningKind::Condition);
}

// ═══════════════════════════════════════════════════════════════════════════
// Map state
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_empty_config_compiles_every_map_empty() {
    let result = compile(&Config::default(), &DirectorySnapshot::default(), clock_at(0, 0));
    assert_eq!(result.maps.len(), 10);
    for map in result.maps.iter() {
        let listed = map.to_list_json();
        assert!(listed["nftables"][1]["map"].get("elem").is_none(), "{}", map.name);
    }
}

#[test]
fn test_removing_sole_rule_empties_its_maps() {
    let mut config = Config {
        forwarding_rules: vec![site_forward_rule("mitm", "10.0.0.5", "443", "mitmproxy0")],
        ..Config::default()
    };
    let directory = sample_directory();
    let before = compile(&config, &directory, clock_at(12, 0));
    assert_eq!(before.maps.element_count(), 2);

    config.forwarding_rules.clear();
    let after = compile(&config, &directory, clock_at(12, 0));
    for name in ["site_forward_tcp_port", "site_forward_tcp_port_mangle"] {
        let listed = after.maps.get(name).unwrap().to_list_json();
        assert!(listed["nftables"][1]["map"].get("elem").is_none());
    }
    assert_eq!(
        after.maps.checksum(),
        compile(&Config::default(), &directory, clock_at(12, 0)).maps.checksum()
    );
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_block()(a in 1u8..255, b in 0u8..255, port in proptest::option::of(1u16..65535), udp in any::<bool>()) -> crate::core::rules::BlockRule {
            let mut rule = block_rule("generated", &format!("10.{a}.{b}.1"));
            rule.dst_port = port.map(|p| p.to_string()).unwrap_or_default();
            if udp {
                rule.protocol = Protocol::Udp;
            }
            rule
        }
    }

    prop_compose! {
        fn arb_forward()(a in 1u8..255, port in 1u16..65535) -> crate::core::rules::ForwardRule {
            forward_rule("generated", &format!("192.168.{a}.10"), &port.to_string(), "192.168.2.20")
        }
    }

    proptest! {
        #[test]
        fn test_compile_is_idempotent(
            blocks in proptest::collection::vec(arb_block(), 0..8),
            forwards in proptest::collection::vec(arb_forward(), 0..8),
            hour in 0u32..24,
        ) {
            let config = Config {
                block_rules: blocks,
                forwarding_rules: forwards,
                ..Config::default()
            };
            let directory = sample_directory();
            let clock = clock_at(hour, 0);
            let first = compile(&config, &directory, clock);
            let second = compile(&config, &directory, clock);
            prop_assert_eq!(first.maps.to_batch(), second.maps.to_batch());
            prop_assert_eq!(first.maps.checksum(), second.maps.checksum());
        }

        #[test]
        fn test_dnat_keys_match_across_maps(
            forwards in proptest::collection::vec(arb_forward(), 0..8),
        ) {
            let config = Config {
                forwarding_rules: forwards,
                ..Config::default()
            };
            let result = compile(&config, &sample_directory(), clock_at(12, 0));
            let ip: Vec<&Value> = result.maps.get("dnat_tcp_ipmap").unwrap().elements.iter().map(|(k, _)| k).collect();
            let port: Vec<&Value> = result.maps.get("dnat_tcp_portmap").unwrap().elements.iter().map(|(k, _)| k).collect();
            prop_assert_eq!(ip, port);
        }
    }

    #[test]
    fn test_clock_now_is_consistent() {
        let clock = Clock::now();
        assert!(clock.unix > 1_600_000_000);
    }
}
