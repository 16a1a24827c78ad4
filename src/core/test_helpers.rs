//! Shared test utilities for core module tests
//!
//! Provides a fixed device directory and rule builders so each suite does
//! not spell out full documents. This module is only compiled in test mode.

use crate::core::compiler::Clock;
use crate::core::identity::{Device, DirectorySnapshot, Endpoint};
use crate::core::rules::{
    BlockRule, Client, Destination, ForwardRule, GroupRule, Protocol, RuleBase, SiteVpn, TagRule,
};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Directory used across the core tests:
///
/// | MAC | name | RecentIP | groups | tags |
/// |---|---|---|---|---|
/// | `AA:BB:CC:DD:EE:01` | laptop | 192.168.2.10 | lan | |
/// | `AA:BB:CC:DD:EE:02` | tablet | 192.168.2.20 | lan | kids |
/// | `AA:BB:CC:DD:EE:03` | printer | | iot | offline |
///
/// Endpoints: `nas` (192.168.5.0/24) and `cloud` (domain only).
pub fn sample_directory() -> DirectorySnapshot {
    let device = |mac: &str, name: &str, ip: &str, groups: &[&str], tags: &[&str]| Device {
        name: name.to_string(),
        mac: mac.to_string(),
        recent_ip: ip.to_string(),
        groups: groups.iter().map(ToString::to_string).collect(),
        device_tags: tags.iter().map(ToString::to_string).collect(),
    };

    let devices: BTreeMap<String, Device> = [
        device("AA:BB:CC:DD:EE:01", "laptop", "192.168.2.10", &["lan"], &[]),
        device("AA:BB:CC:DD:EE:02", "tablet", "192.168.2.20", &["lan"], &["kids"]),
        device("AA:BB:CC:DD:EE:03", "printer", "", &["iot"], &["offline"]),
    ]
    .into_iter()
    .map(|d| (d.mac.clone(), d))
    .collect();

    DirectorySnapshot {
        devices,
        groups: vec!["iot".to_string()],
        endpoints: vec![
            Endpoint {
                rule_name: "nas".to_string(),
                protocol: "tcp".to_string(),
                ip: "192.168.5.0/24".to_string(),
                port: "445".to_string(),
                ..Endpoint::default()
            },
            Endpoint {
                rule_name: "cloud".to_string(),
                protocol: "tcp".to_string(),
                domain: "example.com".to_string(),
                port: "443".to_string(),
                ..Endpoint::default()
            },
        ],
    }
}

/// Wednesday 2025-06-11 at `hh:mm` local, unix time 1_750_000_000.
pub fn clock_at(hour: u32, minute: u32) -> Clock {
    let local = NaiveDate::from_ymd_opt(2025, 6, 11)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .unwrap();
    Clock {
        local,
        unix: 1_750_000_000,
    }
}

/// Always-on TCP block from any client to `dst`, all ports.
pub fn block_rule(name: &str, dst: &str) -> BlockRule {
    BlockRule {
        base: RuleBase {
            client: Client::any(),
            ..RuleBase::named(name)
        },
        protocol: Protocol::Tcp,
        dst: Destination::new(dst),
        dst_port: String::new(),
    }
}

/// Always-on TCP DNAT from any client: `original:port` → `dst` (same port).
pub fn forward_rule(name: &str, original: &str, port: &str, dst: &str) -> ForwardRule {
    ForwardRule {
        base: RuleBase {
            client: Client::any(),
            ..RuleBase::named(name)
        },
        protocol: Some(Protocol::Tcp),
        original_dst: Destination::new(original),
        original_dst_port: port.to_string(),
        dst: Destination::new(dst),
        dst_port: String::new(),
        dst_interface: String::new(),
    }
}

/// Forward steered to `iface` instead of rewritten.
pub fn site_forward_rule(name: &str, original: &str, port: &str, iface: &str) -> ForwardRule {
    ForwardRule {
        dst: Destination::default(),
        dst_interface: iface.to_string(),
        ..forward_rule(name, original, port, "")
    }
}

pub fn tag_rule(name: &str, client: Client, tags: &[&str]) -> TagRule {
    TagRule {
        base: RuleBase {
            client,
            ..RuleBase::named(name)
        },
        tags: tags.iter().map(ToString::to_string).collect(),
    }
}

pub fn group_rule(name: &str, client: Client, groups: &[&str]) -> GroupRule {
    GroupRule {
        base: RuleBase {
            client,
            ..RuleBase::named(name)
        },
        groups: groups.iter().map(ToString::to_string).collect(),
    }
}

pub fn site_vpn(address: &str) -> SiteVpn {
    SiteVpn {
        address: address.to_string(),
        peer_public_key: "cGVlci1wdWJsaWMta2V5LWZvci10ZXN0cy0wMDAwMDA9".to_string(),
        private_key: String::new(),
        preshared_key: String::new(),
        endpoint: "vpn.example.com:51820".to_string(),
    }
}
