//! Rule compiler: store snapshot → nftables maps
//!
//! Compilation is a pure function of the rule snapshot, the directory
//! snapshot and the clock. Identical inputs give byte-identical maps.
//!
//! Order of evaluation:
//! 1. Tag and group rules, granting memberships to the clients they match
//! 2. Forward rules
//! 3. Block rules
//!
//! Within a map the first rule to produce a key wins; later rules producing
//! the same key get a [`WarningKind::DuplicateKey`] warning.
//!
//! | map | table | key | value |
//! |---|---|---|---|
//! | `site_forward_{proto}_port` | filter | `src . dst . port . ifname` | accept |
//! | `site_forward_{proto}_port_mangle` | mangle | `src . dst . port` | accept |
//! | `dnat_{proto}_ipmap` | nat | `src . dst . port` | new destination |
//! | `dnat_{proto}_portmap` | nat | `src . dst . port` | new port |
//! | `pfw_block_{proto}` | filter | `src . dst . port` | drop |

use crate::core::expr::{self, Context};
use crate::core::identity::{DirectorySnapshot, Resolved, Resolver};
use crate::core::nft_json::{self, NftMap, addr_json, concat, port_json, verdict};
use crate::core::rules::{Bucket, Config, ForwardRule, Protocol, RuleBase};
use crate::validators;
use chrono::NaiveDateTime;
use ipnetwork::IpNetwork;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

/// Key component for "any source"
pub const ANY_SOURCE: &str = "0.0.0.0";

const ADDR_PORT_KEY: [&str; 3] = ["ipv4_addr", "ipv4_addr", "inet_service"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WarningKind {
    NoMatchingClients,
    UnknownInterface,
    DuplicateKey,
    Condition,
    InvalidRule,
}

/// A rule that is stored but currently contributes nothing (or less than
/// it asks for)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileWarning {
    pub bucket: String,
    pub index: usize,
    pub rule: String,
    pub kind: WarningKind,
    pub message: String,
}

/// Wall-clock inputs to a compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    /// Local time, for windows and `hour`/`minute`/`weekday`
    pub local: NaiveDateTime,
    /// Unix seconds, for `Expiration`
    pub unix: i64,
}

impl Clock {
    pub fn now() -> Self {
        let now = chrono::Local::now();
        Self {
            local: now.naive_local(),
            unix: now.timestamp(),
        }
    }
}

/// Named maps produced by one compile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirewallMaps {
    maps: BTreeMap<String, NftMap>,
}

impl FirewallMaps {
    pub fn insert(&mut self, map: NftMap) {
        self.maps.insert(map.name.clone(), map);
    }

    pub fn get(&self, name: &str) -> Option<&NftMap> {
        self.maps.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NftMap> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.maps.values().map(|m| m.elements.len()).sum()
    }

    pub fn extend(&mut self, maps: impl IntoIterator<Item = NftMap>) {
        for map in maps {
            self.insert(map);
        }
    }

    /// The replace-everything nft batch for these maps.
    pub fn to_batch(&self) -> Value {
        nft_json::batch(self.maps.values())
    }

    pub fn checksum(&self) -> String {
        nft_json::compute_checksum(&self.to_batch())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compilation {
    pub maps: FirewallMaps,
    pub warnings: Vec<CompileWarning>,
}

/// A map plus the keys already claimed in it
struct KeyedMap {
    map: NftMap,
    seen: HashSet<String>,
}

impl KeyedMap {
    fn new(map: NftMap) -> Self {
        Self {
            map,
            seen: HashSet::new(),
        }
    }

    fn claims(&self, key: &Value) -> bool {
        self.seen.contains(&key.to_string())
    }

    fn push(&mut self, key: Value, value: Value) {
        self.seen.insert(key.to_string());
        self.map.push(key, value);
    }
}

struct ProtoMaps {
    site_forward: KeyedMap,
    site_forward_mangle: KeyedMap,
    dnat_ip: KeyedMap,
    dnat_port: KeyedMap,
    block: KeyedMap,
}

impl ProtoMaps {
    fn new(proto: Protocol) -> Self {
        Self {
            site_forward: KeyedMap::new(NftMap::new(
                "filter",
                format!("site_forward_{proto}_port"),
                &["ipv4_addr", "ipv4_addr", "inet_service", "ifname"],
                &["verdict"],
            )),
            site_forward_mangle: KeyedMap::new(NftMap::new(
                "mangle",
                format!("site_forward_{proto}_port_mangle"),
                &ADDR_PORT_KEY,
                &["verdict"],
            )),
            dnat_ip: KeyedMap::new(NftMap::new(
                "nat",
                format!("dnat_{proto}_ipmap"),
                &ADDR_PORT_KEY,
                &["ipv4_addr"],
            )),
            dnat_port: KeyedMap::new(NftMap::new(
                "nat",
                format!("dnat_{proto}_portmap"),
                &ADDR_PORT_KEY,
                &["inet_service"],
            )),
            block: KeyedMap::new(NftMap::new(
                "filter",
                format!("pfw_block_{proto}"),
                &ADDR_PORT_KEY,
                &["verdict"],
            )),
        }
    }

    fn into_maps(self) -> [NftMap; 5] {
        [
            self.site_forward.map,
            self.site_forward_mangle.map,
            self.dnat_ip.map,
            self.dnat_port.map,
            self.block.map,
        ]
    }
}

struct Compiler<'a> {
    config: &'a Config,
    clock: Clock,
    warnings: Vec<CompileWarning>,
}

impl Compiler<'_> {
    fn warn(&mut self, bucket: Bucket, index: usize, base: &RuleBase, kind: WarningKind, message: String) {
        warn!(
            bucket = %bucket,
            index,
            rule = %validators::sanitize_label(&base.rule_name),
            kind = %kind,
            "{message}"
        );
        self.warnings.push(CompileWarning {
            bucket: bucket.to_string(),
            index,
            rule: base.rule_name.clone(),
            kind,
            message,
        });
    }

    /// Enabled, unexpired, inside its window and its condition holds.
    fn is_live(&mut self, bucket: Bucket, index: usize, base: &RuleBase) -> bool {
        if base.disabled {
            debug!(bucket = %bucket, index, "rule disabled");
            return false;
        }
        if base.is_expired(self.clock.unix) {
            debug!(bucket = %bucket, index, "rule expired");
            return false;
        }
        match base.time.schedule() {
            Ok(schedule) if !schedule.is_active(self.clock.local) => {
                debug!(bucket = %bucket, index, "rule outside its time window");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                self.warn(bucket, index, base, WarningKind::InvalidRule, e.to_string());
                return false;
            }
        }
        let config = self.config;
        let ctx = Context::new(&config.variables, self.clock.local);
        match expr::condition_holds(&base.condition, &ctx) {
            Ok(holds) => holds,
            Err(e) => {
                self.warn(
                    bucket,
                    index,
                    base,
                    WarningKind::Condition,
                    format!("condition not evaluated: {e}"),
                );
                false
            }
        }
    }

    /// Source key components for a live rule, or `None` after warning.
    fn sources(
        &mut self,
        resolver: &Resolver<'_>,
        bucket: Bucket,
        index: usize,
        base: &RuleBase,
    ) -> Option<Vec<Value>> {
        let selector = match base.client.to_match() {
            Ok(selector) => selector,
            Err(e) => {
                self.warn(bucket, index, base, WarningKind::InvalidRule, e.to_string());
                return None;
            }
        };
        match resolver.resolve(&selector) {
            Resolved::Any => Some(vec![json!(ANY_SOURCE)]),
            Resolved::Addresses(list) if list.is_empty() => {
                self.warn(
                    bucket,
                    index,
                    base,
                    WarningKind::NoMatchingClients,
                    format!("rule has no matching clients ({selector})"),
                );
                None
            }
            Resolved::Addresses(list) => {
                let (v4, v6): (Vec<IpNetwork>, Vec<IpNetwork>) =
                    list.into_iter().partition(IpNetwork::is_ipv4);
                if !v6.is_empty() {
                    debug!(bucket = %bucket, index, skipped = v6.len(), "IPv6 clients not mapped");
                }
                if v4.is_empty() {
                    self.warn(
                        bucket,
                        index,
                        base,
                        WarningKind::NoMatchingClients,
                        format!("rule has no IPv4 clients ({selector})"),
                    );
                    return None;
                }
                Some(v4.iter().map(addr_json).collect())
            }
        }
    }

    fn resolved_addresses(resolver: &Resolver<'_>, base: &RuleBase) -> Vec<IpNetwork> {
        match base.client.to_match().map(|s| resolver.resolve(&s)) {
            Ok(Resolved::Addresses(list)) => list,
            Ok(Resolved::Any) => IpNetwork::new(Ipv4Addr::UNSPECIFIED.into(), 0)
                .into_iter()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn compile_memberships(&mut self, resolver: &mut Resolver<'_>) {
        let config = self.config;
        for (index, rule) in config.tag_rules.iter().enumerate() {
            if !self.is_live(Bucket::Tag, index, &rule.base) {
                continue;
            }
            let members = Self::resolved_addresses(resolver, &rule.base);
            if members.is_empty() {
                self.warn(
                    Bucket::Tag,
                    index,
                    &rule.base,
                    WarningKind::NoMatchingClients,
                    "rule has no matching clients".to_string(),
                );
                continue;
            }
            for tag in &rule.tags {
                resolver.grant_tag(tag, &members);
            }
        }
        for (index, rule) in config.group_rules.iter().enumerate() {
            if !self.is_live(Bucket::Group, index, &rule.base) {
                continue;
            }
            let members = Self::resolved_addresses(resolver, &rule.base);
            if members.is_empty() {
                self.warn(
                    Bucket::Group,
                    index,
                    &rule.base,
                    WarningKind::NoMatchingClients,
                    "rule has no matching clients".to_string(),
                );
                continue;
            }
            for group in &rule.groups {
                resolver.grant_group(group, &members);
            }
        }
    }

    fn forward_target(&mut self, index: usize, rule: &ForwardRule) -> Option<(Value, Value, Option<(Value, Value)>)> {
        let fail = |this: &mut Self, e: String| {
            this.warn(Bucket::Forward, index, &rule.base, WarningKind::InvalidRule, e);
            None
        };

        let dst = match rule.original_dst.address("OriginalDst") {
            Ok(Some(net)) => destination_json(&net),
            Ok(None) => return fail(self, "OriginalDst.IP: required".into()),
            Err(e) => return fail(self, e.to_string()),
        };
        let original_port = match rule.original_port_range() {
            Ok(range) => range,
            Err(e) => return fail(self, format!("OriginalDstPort: {e}")),
        };
        let port = port_json(original_port.0, original_port.1);

        if !rule.dst_interface.is_empty() {
            return Some((dst, port, None));
        }

        let new_dst = match rule.dst.address("Dst") {
            Ok(Some(net)) if !net.ip().is_unspecified() => json!(net.ip().to_string()),
            Ok(_) => return fail(self, "Dst.IP: a single address is required".into()),
            Err(e) => return fail(self, e.to_string()),
        };
        let new_port = match validators::parse_port_spec(&rule.dst_port) {
            Ok(Some((a, b))) if a == b => a,
            Ok(None) if original_port.0 == original_port.1 => original_port.0,
            Ok(_) => return fail(self, "DstPort: must resolve to a single port".into()),
            Err(e) => return fail(self, format!("DstPort: {e}")),
        };
        Some((dst, port, Some((new_dst, json!(new_port)))))
    }

    fn interface_known(&self, name: &str) -> bool {
        match name.strip_prefix("site").map(str::parse::<usize>) {
            Some(Ok(i)) => i < self.config.site_vpns.len(),
            _ => true,
        }
    }

    fn compile_forwards(&mut self, resolver: &Resolver<'_>, maps: &mut BTreeMap<Protocol, ProtoMaps>) {
        let config = self.config;
        for (index, rule) in config.forwarding_rules.iter().enumerate() {
            if !self.is_live(Bucket::Forward, index, &rule.base) {
                continue;
            }
            if !rule.dst_interface.is_empty() && !self.interface_known(&rule.dst_interface) {
                self.warn(
                    Bucket::Forward,
                    index,
                    &rule.base,
                    WarningKind::UnknownInterface,
                    format!(
                        "{} has no site VPN (configured: {})",
                        rule.dst_interface,
                        config.site_vpns.len()
                    ),
                );
                continue;
            }
            let Some((dst, port, rewrite)) = self.forward_target(index, rule) else {
                continue;
            };
            let Some(sources) = self.sources(resolver, Bucket::Forward, index, &rule.base) else {
                continue;
            };
            for protocol in rule.protocols() {
                let Some(proto_maps) = maps.get_mut(&protocol) else {
                    continue;
                };
                self.push_forward(index, rule, proto_maps, &sources, (&dst, &port), rewrite.as_ref());
            }
        }
    }

    fn push_forward(
        &mut self,
        index: usize,
        rule: &ForwardRule,
        proto_maps: &mut ProtoMaps,
        sources: &[Value],
        (dst, port): (&Value, &Value),
        rewrite: Option<&(Value, Value)>,
    ) {
        for src in sources {
            let key = concat(vec![src.clone(), dst.clone(), port.clone()]);
            let taken = match rewrite {
                None => proto_maps.site_forward_mangle.claims(&key),
                Some(_) => proto_maps.dnat_ip.claims(&key),
            };
            if taken {
                self.warn(
                    Bucket::Forward,
                    index,
                    &rule.base,
                    WarningKind::DuplicateKey,
                    format!("{key} already claimed by an earlier rule"),
                );
                continue;
            }
            match rewrite {
                None => {
                    let iface_key = concat(vec![
                        src.clone(),
                        dst.clone(),
                        port.clone(),
                        json!(rule.dst_interface),
                    ]);
                    proto_maps.site_forward.push(iface_key, verdict("accept"));
                    proto_maps.site_forward_mangle.push(key, verdict("accept"));
                }
                Some((new_dst, new_port)) => {
                    proto_maps.dnat_ip.push(key.clone(), new_dst.clone());
                    proto_maps.dnat_port.push(key, new_port.clone());
                }
            }
        }
    }

    fn compile_blocks(&mut self, resolver: &Resolver<'_>, maps: &mut BTreeMap<Protocol, ProtoMaps>) {
        let config = self.config;
        for (index, rule) in config.block_rules.iter().enumerate() {
            if !self.is_live(Bucket::Block, index, &rule.base) {
                continue;
            }
            let dst = match rule.dst.address("Dst") {
                Ok(Some(net)) => destination_json(&net),
                Ok(None) => {
                    let message = "Dst.IP: required".to_string();
                    self.warn(Bucket::Block, index, &rule.base, WarningKind::InvalidRule, message);
                    continue;
                }
                Err(e) => {
                    self.warn(Bucket::Block, index, &rule.base, WarningKind::InvalidRule, e.to_string());
                    continue;
                }
            };
            let port = match validators::parse_port_spec(&rule.dst_port) {
                Ok(Some((a, b))) => port_json(a, b),
                Ok(None) => port_json(0, u16::MAX),
                Err(e) => {
                    self.warn(Bucket::Block, index, &rule.base, WarningKind::InvalidRule, e);
                    continue;
                }
            };
            let Some(sources) = self.sources(resolver, Bucket::Block, index, &rule.base) else {
                continue;
            };
            let Some(proto_maps) = maps.get_mut(&rule.protocol) else {
                continue;
            };
            for src in sources {
                let key = concat(vec![src, dst.clone(), port.clone()]);
                if proto_maps.block.claims(&key) {
                    self.warn(
                        Bucket::Block,
                        index,
                        &rule.base,
                        WarningKind::DuplicateKey,
                        format!("{key} already claimed by an earlier rule"),
                    );
                    continue;
                }
                proto_maps.block.push(key, verdict("drop"));
            }
        }
    }
}

/// Destination key component. An unspecified address stands for every
/// destination.
fn destination_json(net: &IpNetwork) -> Value {
    if net.ip().is_unspecified() {
        json!({ "prefix": { "addr": ANY_SOURCE, "len": 0 } })
    } else {
        addr_json(net)
    }
}

/// Compiles a rule snapshot into PFW maps.
pub fn compile(config: &Config, directory: &DirectorySnapshot, clock: Clock) -> Compilation {
    let mut compiler = Compiler {
        config,
        clock,
        warnings: Vec::new(),
    };

    let mut resolver = Resolver::new(directory);
    compiler.compile_memberships(&mut resolver);

    let mut maps: BTreeMap<Protocol, ProtoMaps> =
        Protocol::iter().map(|p| (p, ProtoMaps::new(p))).collect();
    compiler.compile_forwards(&resolver, &mut maps);
    compiler.compile_blocks(&resolver, &mut maps);

    let mut out = FirewallMaps::default();
    for proto_maps in maps.into_values() {
        out.extend(proto_maps.into_maps());
    }

    debug!(
        maps = out.len(),
        elements = out.element_count(),
        warnings = compiler.warnings.len(),
        "compiled PFW rules"
    );

    Compilation {
        maps: out,
        warnings: compiler.warnings,
    }
}
