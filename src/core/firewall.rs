//! Plain firewall rules (`/firewall/...`)
//!
//! The older sibling of the PFW engine: no schedules, no client lookup, and
//! deletion by attribute match instead of by index. A DELETE body is a
//! partial document; every rule whose fields equal all the given fields is
//! removed.
//!
//! Compiled maps:
//!
//! | map | table | key | value |
//! |---|---|---|---|
//! | `block` | nat | `SrcIP . DstIP . proto` | drop |
//! | `{proto}fwd` | nat | `SrcIP . SrcPort` | `DstIP . DstPort` |
//! | `{proto}anyfwd` | nat | `SrcIP` | `DstIP` |
//! | `lan_{proto}_accept` / `wan_{proto}_accept` | filter | port | accept |

use crate::core::error::{Error, Result};
use crate::core::nft_json::{NftMap, addr_json, concat, port_json, verdict};
use crate::core::rules::Protocol;
use crate::validators;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::IntoEnumIterator;
use tracing::warn;

pub const ANY_PORT: &str = "any";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardingRule {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub disabled: bool,
    pub protocol: Protocol,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    #[serde(default)]
    pub src_port: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(default)]
    pub dst_port: String,
}

impl ForwardingRule {
    pub fn validate(&self) -> Result<()> {
        validators::validate_label(&self.rule_name)
            .map_err(|e| Error::validation("RuleName", e))?;
        validators::parse_address(&self.src_ip).map_err(|e| Error::validation("SrcIP", e))?;
        let dst = validators::parse_address(&self.dst_ip)
            .map_err(|e| Error::validation("DstIP", e))?;
        let host_prefix = if dst.is_ipv4() { 32 } else { 128 };
        if dst.prefix() != host_prefix {
            return Err(Error::validation("DstIP", "must be a single address"));
        }

        if self.dst_port == ANY_PORT {
            return Ok(());
        }
        match validators::parse_port_spec(&self.dst_port) {
            Ok(Some((a, b))) if a == b => {}
            _ => return Err(Error::validation("DstPort", "must be a single port or \"any\"")),
        }
        match validators::parse_port_spec(&self.src_port) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::validation("SrcPort", "required")),
            Err(e) => Err(Error::validation("SrcPort", e)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct BlockRule {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub disabled: bool,
    pub protocol: Protocol,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
}

impl BlockRule {
    pub fn validate(&self) -> Result<()> {
        validators::validate_label(&self.rule_name)
            .map_err(|e| Error::validation("RuleName", e))?;
        validators::parse_address(&self.src_ip).map_err(|e| Error::validation("SrcIP", e))?;
        validators::parse_address(&self.dst_ip).map_err(|e| Error::validation("DstIP", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServicePort {
    pub protocol: Protocol,
    pub port: String,
    #[serde(default)]
    pub upstream_enabled: bool,
}

impl ServicePort {
    pub fn validate(&self) -> Result<u16> {
        match validators::parse_port_spec(&self.port) {
            Ok(Some((a, b))) if a == b && a != 0 => Ok(a),
            _ => Err(Error::validation("Port", "must be a single port 1-65535")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FirewallConfig {
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,
    #[serde(default)]
    pub block_rules: Vec<BlockRule>,
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,
}

impl FirewallConfig {
    pub fn add_forward(&mut self, rule: ForwardingRule) -> Result<()> {
        rule.validate()?;
        self.forwarding_rules.push(rule);
        Ok(())
    }

    pub fn add_block(&mut self, rule: BlockRule) -> Result<()> {
        rule.validate()?;
        self.block_rules.push(rule);
        Ok(())
    }

    /// Adds a service port, or updates `UpstreamEnabled` on an existing
    /// protocol/port pair.
    pub fn upsert_service_port(&mut self, port: ServicePort) -> Result<()> {
        port.validate()?;
        match self
            .service_ports
            .iter_mut()
            .find(|p| p.protocol == port.protocol && p.port == port.port)
        {
            Some(existing) => existing.upstream_enabled = port.upstream_enabled,
            None => self.service_ports.push(port),
        }
        Ok(())
    }

    pub fn delete_forward(&mut self, pattern: &Value) -> Result<usize> {
        delete_where(&mut self.forwarding_rules, pattern)
    }

    pub fn delete_block(&mut self, pattern: &Value) -> Result<usize> {
        delete_where(&mut self.block_rules, pattern)
    }

    pub fn delete_service_port(&mut self, pattern: &Value) -> Result<usize> {
        delete_where(&mut self.service_ports, pattern)
    }

    /// Every plain firewall map, including empty ones.
    pub fn compile(&self) -> Vec<NftMap> {
        let mut block = NftMap::new(
            "nat",
            "block",
            &["ipv4_addr", "ipv4_addr", "inet_proto"],
            &["verdict"],
        );
        for rule in self.block_rules.iter().filter(|r| !r.disabled) {
            let (Ok(src), Ok(dst)) = (
                validators::parse_address(&rule.src_ip),
                validators::parse_address(&rule.dst_ip),
            ) else {
                warn!(rule = %rule.rule_name, "skipping malformed block rule");
                continue;
            };
            block.push(
                concat(vec![addr_json(&src), addr_json(&dst), json!(rule.protocol.as_str())]),
                verdict("drop"),
            );
        }

        let mut maps = vec![block];

        for proto in Protocol::iter() {
            let mut fwd = NftMap::new(
                "nat",
                format!("{proto}fwd"),
                &["ipv4_addr", "inet_service"],
                &["ipv4_addr", "inet_service"],
            );
            let mut anyfwd = NftMap::new("nat", format!("{proto}anyfwd"), &["ipv4_addr"], &["ipv4_addr"]);

            for rule in self
                .forwarding_rules
                .iter()
                .filter(|r| !r.disabled && r.protocol == proto)
            {
                if let Err(e) = push_forward(rule, &mut fwd, &mut anyfwd) {
                    warn!(rule = %rule.rule_name, "skipping malformed forwarding rule: {e}");
                }
            }
            maps.push(fwd);
            maps.push(anyfwd);
        }

        for proto in Protocol::iter() {
            let mut lan = NftMap::new("filter", format!("lan_{proto}_accept"), &["inet_service"], &["verdict"]).exact();
            let mut wan = NftMap::new("filter", format!("wan_{proto}_accept"), &["inet_service"], &["verdict"]).exact();
            for port in self.service_ports.iter().filter(|p| p.protocol == proto) {
                let Ok(number) = port.validate() else {
                    warn!(port = %port.port, "skipping malformed service port");
                    continue;
                };
                lan.push(json!(number), verdict("accept"));
                if port.upstream_enabled {
                    wan.push(json!(number), verdict("accept"));
                }
            }
            maps.push(lan);
            maps.push(wan);
        }

        maps
    }
}

fn push_forward(rule: &ForwardingRule, fwd: &mut NftMap, anyfwd: &mut NftMap) -> Result<()> {
    rule.validate()?;
    let src = validators::parse_address(&rule.src_ip).map_err(|e| Error::validation("SrcIP", e))?;
    let dst = validators::parse_address(&rule.dst_ip).map_err(|e| Error::validation("DstIP", e))?;

    if rule.dst_port == ANY_PORT {
        anyfwd.push(addr_json(&src), addr_json(&dst));
        return Ok(());
    }

    let (src_start, src_end) = validators::parse_port_spec(&rule.src_port)
        .map_err(|e| Error::validation("SrcPort", e))?
        .ok_or_else(|| Error::validation("SrcPort", "required"))?;
    let (dst_port, _) = validators::parse_port_spec(&rule.dst_port)
        .map_err(|e| Error::validation("DstPort", e))?
        .ok_or_else(|| Error::validation("DstPort", "required"))?;

    fwd.push(
        concat(vec![addr_json(&src), port_json(src_start, src_end)]),
        concat(vec![addr_json(&dst), json!(dst_port)]),
    );
    Ok(())
}

/// Removes every entry whose serialized fields equal all fields of `pattern`.
///
/// # Errors
///
/// - `Validation` when the pattern is not a non-empty object or names a
///   field the entries do not have
/// - `NotFound` when nothing matched
pub fn delete_where<T: Serialize>(entries: &mut Vec<T>, pattern: &Value) -> Result<usize> {
    let fields = pattern
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::validation("body", "expected a non-empty JSON object"))?;

    let serialized: Vec<Value> = entries
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<_, _>>()?;

    if let Some(sample) = serialized.first().and_then(Value::as_object)
        && let Some(unknown) = fields.keys().find(|k| !sample.contains_key(*k))
    {
        return Err(Error::validation(unknown.clone(), "unknown field"));
    }

    let keep: Vec<bool> = serialized
        .iter()
        .map(|value| !fields.iter().all(|(k, v)| value.get(k) == Some(v)))
        .collect();

    let removed = keep.iter().filter(|k| !**k).count();
    if removed == 0 {
        return Err(Error::not_found("no matching rules"));
    }

    let mut flags = keep.into_iter();
    entries.retain(|_| flags.next().unwrap_or(true));
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fwd(src_port: &str, dst_port: &str) -> ForwardingRule {
        ForwardingRule {
            rule_name: "web".into(),
            disabled: false,
            protocol: Protocol::Tcp,
            src_ip: "0.0.0.0/0".into(),
            src_port: src_port.into(),
            dst_ip: "192.168.2.20".into(),
            dst_port: dst_port.into(),
        }
    }

    fn block(src: &str, dst: &str) -> BlockRule {
        BlockRule {
            rule_name: String::new(),
            disabled: false,
            protocol: Protocol::Udp,
            src_ip: src.into(),
            dst_ip: dst.into(),
        }
    }

    fn find<'a>(maps: &'a [NftMap], name: &str) -> &'a NftMap {
        maps.iter().find(|m| m.name == name).unwrap()
    }

    #[test]
    fn test_forward_validation() {
        assert!(fwd("8080", "80").validate().is_ok());
        assert!(fwd("8000-8010", "80").validate().is_ok());
        assert!(fwd("", "any").validate().is_ok());
        assert!(fwd("", "80").validate().is_err());
        assert!(fwd("80", "80-90").validate().is_err());
        assert!(fwd("80", "http").validate().is_err());

        let mut bad_dst = fwd("80", "80");
        bad_dst.dst_ip = "192.168.2.0/24".into();
        assert!(bad_dst.validate().is_err());
    }

    #[test]
    fn test_block_validation() {
        assert!(block("1.2.3.4", "5.6.7.0/24").validate().is_ok());
        assert!(block("nope", "5.6.7.8").validate().is_err());
    }

    #[test]
    fn test_service_port_upsert() {
        let mut config = FirewallConfig::default();
        let port = ServicePort {
            protocol: Protocol::Tcp,
            port: "22".into(),
            upstream_enabled: false,
        };
        config.upsert_service_port(port.clone()).unwrap();
        config
            .upsert_service_port(ServicePort {
                upstream_enabled: true,
                ..port
            })
            .unwrap();
        assert_eq!(config.service_ports.len(), 1);
        assert!(config.service_ports[0].upstream_enabled);

        assert!(
            config
                .upsert_service_port(ServicePort {
                    protocol: Protocol::Tcp,
                    port: "0".into(),
                    upstream_enabled: false,
                })
                .is_err()
        );
    }

    #[test]
    fn test_delete_where_removes_all_matches() {
        let mut config = FirewallConfig::default();
        config.add_block(block("1.1.1.1", "2.2.2.2")).unwrap();
        config.add_block(block("1.1.1.1", "3.3.3.3")).unwrap();
        config.add_block(block("9.9.9.9", "2.2.2.2")).unwrap();

        let removed = config.delete_block(&json!({"SrcIP": "1.1.1.1"})).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(config.block_rules.len(), 1);
        assert_eq!(config.block_rules[0].src_ip, "9.9.9.9");
    }

    #[test]
    fn test_delete_where_errors() {
        let mut config = FirewallConfig::default();
        config.add_block(block("1.1.1.1", "2.2.2.2")).unwrap();

        assert!(matches!(
            config.delete_block(&json!({"SrcIP": "8.8.8.8"})),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            config.delete_block(&json!({})),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            config.delete_block(&json!({"Color": "red"})),
            Err(Error::Validation { .. })
        ));
        assert_eq!(config.block_rules.len(), 1);
    }

    #[test]
    fn test_delete_where_full_document() {
        let mut config = FirewallConfig::default();
        config.add_forward(fwd("8080", "80")).unwrap();
        config.add_forward(fwd("8081", "80")).unwrap();
        let pattern = serde_json::to_value(fwd("8080", "80")).unwrap();
        assert_eq!(config.delete_forward(&pattern).unwrap(), 1);
        assert_eq!(config.forwarding_rules[0].src_port, "8081");
    }

    #[test]
    fn test_compile_plain_maps() {
        let mut config = FirewallConfig::default();
        config.add_forward(fwd("8080", "80")).unwrap();
        config.add_forward(fwd("", "any")).unwrap();
        config.add_block(block("1.1.1.1", "2.2.2.0/24")).unwrap();
        config
            .upsert_service_port(ServicePort {
                protocol: Protocol::Udp,
                port: "53".into(),
                upstream_enabled: false,
            })
            .unwrap();

        let maps = config.compile();
        assert_eq!(maps.len(), 9);

        let tcpfwd = find(&maps, "tcpfwd");
        assert_eq!(
            tcpfwd.elements[0],
            (
                json!({"concat": [{"prefix": {"addr": "0.0.0.0", "len": 0}}, 8080]}),
                json!({"concat": ["192.168.2.20", 80]})
            )
        );
        assert_eq!(find(&maps, "tcpanyfwd").elements.len(), 1);
        assert!(find(&maps, "udpfwd").is_empty());

        let block_map = find(&maps, "block");
        assert_eq!(
            block_map.elements[0].0,
            json!({"concat": ["1.1.1.1", {"prefix": {"addr": "2.2.2.0", "len": 24}}, "udp"]})
        );
        assert_eq!(block_map.elements[0].1, json!({"drop": null}));

        assert_eq!(find(&maps, "lan_udp_accept").elements[0].0, json!(53));
        assert!(find(&maps, "wan_udp_accept").is_empty());
    }

    #[test]
    fn test_disabled_rules_not_compiled() {
        let mut config = FirewallConfig::default();
        let mut rule = block("1.1.1.1", "2.2.2.2");
        rule.disabled = true;
        config.add_block(rule).unwrap();
        assert!(find(&config.compile(), "block").is_empty());
    }
}
