//! Rule documents and the aggregate `Config` projection
//!
//! All documents travel as PascalCase JSON (`RuleName`, `SrcIP`, `DstPort`).
//! Block, forward, tag and group rules share a flattened [`RuleBase`].
//!
//! # Example
//!
//! ```
//! use pfw::core::rules::{BlockRule, ClientMatch};
//!
//! let rule: BlockRule = serde_json::from_str(r#"{
//!     "RuleName": "Block TCP test",
//!     "Time": {"Days": [], "Start": "", "End": ""},
//!     "Protocol": "tcp",
//!     "Client": {"SrcIP": "0.0.0.0"},
//!     "Dst": {"IP": "1.2.3.4"},
//!     "DstPort": ""
//! }"#).unwrap();
//!
//! assert_eq!(rule.base.client.to_match().unwrap(), ClientMatch::Any);
//! ```

use crate::core::error::{Error, Result};
use crate::core::schedule::TimeWindow;
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::IntoEnumIterator;

/// Placeholder emitted in place of secrets
pub const MASKED: &str = "*masked*";

/// Maximum number of rules allowed per bucket
pub const MAX_RULES: usize = 1000;

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// The independently indexed rule sequences
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Bucket {
    Block,
    Forward,
    Tag,
    Group,
    #[strum(serialize = "sitevpns")]
    SiteVpn,
}

// ═══════════════════════════════════════════════════════════════════════════
// Clients
// ═══════════════════════════════════════════════════════════════════════════

/// The `Client` one-of as it appears on the wire
///
/// A bare JSON string is accepted too and parked in `identity` until the
/// store classifies it against the group directory.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Client {
    pub group: String,
    pub identity: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    pub tag: String,
    pub endpoint: String,
    #[serde(skip)]
    pub(crate) unclassified: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClientFields {
    #[serde(default)]
    group: String,
    #[serde(default)]
    identity: String,
    #[serde(rename = "SrcIP", default)]
    src_ip: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    endpoint: String,
}

impl<'de> Deserialize<'de> for Client {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(String),
            Fields(ClientFields),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bare(text) => Client::from_bare(&text),
            Repr::Fields(f) => Client {
                group: f.group,
                identity: f.identity,
                src_ip: f.src_ip,
                tag: f.tag,
                endpoint: f.endpoint,
                unclassified: false,
            },
        })
    }
}

impl Client {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn src_ip(ip: &str) -> Self {
        Self {
            src_ip: ip.to_string(),
            ..Self::default()
        }
    }

    pub fn group(name: &str) -> Self {
        Self {
            group: name.to_string(),
            ..Self::default()
        }
    }

    pub fn identity(name: &str) -> Self {
        Self {
            identity: name.to_string(),
            ..Self::default()
        }
    }

    pub fn tag(name: &str) -> Self {
        Self {
            tag: name.to_string(),
            ..Self::default()
        }
    }

    pub fn endpoint(name: &str) -> Self {
        Self {
            endpoint: name.to_string(),
            ..Self::default()
        }
    }

    /// Free-text client. Dotted quads are addresses right away; anything
    /// else waits for the group directory.
    pub fn from_bare(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::any();
        }
        if validators::is_dotted_quad(text) {
            return Self::src_ip(text);
        }
        Self {
            identity: text.to_string(),
            unclassified: true,
            ..Self::default()
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.unclassified
    }

    /// Resolves the one-of. First non-empty field wins in the order
    /// Group, Identity, SrcIP, Tag, Endpoint.
    pub fn to_match(&self) -> Result<ClientMatch> {
        if !self.group.is_empty() {
            return Ok(ClientMatch::Group(self.group.clone()));
        }
        if !self.identity.is_empty() {
            return Ok(ClientMatch::Identity(self.identity.clone()));
        }
        if !self.src_ip.is_empty() {
            let net = validators::parse_address(&self.src_ip)
                .map_err(|e| Error::validation("Client.SrcIP", e))?;
            if net.ip().is_unspecified() {
                return Ok(ClientMatch::Any);
            }
            return Ok(ClientMatch::SrcIp(net));
        }
        if !self.tag.is_empty() {
            return Ok(ClientMatch::Tag(self.tag.clone()));
        }
        if !self.endpoint.is_empty() {
            return Ok(ClientMatch::Endpoint(self.endpoint.clone()));
        }
        Ok(ClientMatch::Any)
    }
}

/// Resolved client selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMatch {
    Group(String),
    Identity(String),
    SrcIp(IpNetwork),
    Tag(String),
    Endpoint(String),
    Any,
}

impl fmt::Display for ClientMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMatch::Group(g) => write!(f, "group {g}"),
            ClientMatch::Identity(i) => write!(f, "identity {i}"),
            ClientMatch::SrcIp(net) => write!(f, "address {net}"),
            ClientMatch::Tag(t) => write!(f, "tag {t}"),
            ClientMatch::Endpoint(e) => write!(f, "endpoint {e}"),
            ClientMatch::Any => write!(f, "any client"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RuleBase {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub time: TimeWindow,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub client: Client,
    /// Unix timestamp, 0 = never
    #[serde(default)]
    pub expiration: i64,
}

impl RuleBase {
    pub fn named(name: &str) -> Self {
        Self {
            rule_name: name.to_string(),
            ..Self::default()
        }
    }

    /// Checks every shared field and fills in the derived time representation.
    pub fn normalize(&mut self) -> Result<()> {
        validators::validate_label(&self.rule_name)
            .map_err(|e| Error::validation("RuleName", e))?;
        self.time.normalize()?;
        if !self.condition.trim().is_empty() {
            crate::core::expr::parse(&self.condition)?;
        }
        self.client.to_match()?;
        if self.expiration < 0 {
            return Err(Error::validation("Expiration", "must be 0 or a unix timestamp"));
        }
        Ok(())
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expiration != 0 && now_unix >= self.expiration
    }
}

/// `Dst` / `OriginalDst`: an address or CIDR in `IP`, or a name in `Domain`
///
/// Maps are keyed by address, so a `Domain` is refused rather than read as
/// "any destination". Unknown fields are refused for the same reason.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(rename = "Domain", default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

impl Destination {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            domain: String::new(),
        }
    }

    pub fn domain(name: &str) -> Self {
        Self {
            ip: String::new(),
            domain: name.to_string(),
        }
    }

    /// The network this destination names, `None` when both fields are empty.
    pub fn address(&self, field: &str) -> Result<Option<IpNetwork>> {
        let ip = self.ip.trim();
        let domain = self.domain.trim();
        match (ip.is_empty(), domain.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => Err(Error::validation(field, "set either IP or Domain, not both")),
            (true, false) => Err(Error::validation(
                format!("{field}.Domain"),
                "domain destinations are not supported, use an IP or CIDR",
            )),
            (false, true) => validators::parse_address(ip)
                .map(Some)
                .map_err(|e| Error::validation(format!("{field}.IP"), e)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct BlockRule {
    #[serde(flatten)]
    pub base: RuleBase,
    pub protocol: Protocol,
    /// `0.0.0.0/0` (or `0.0.0.0`) for every destination
    pub dst: Destination,
    /// Single port, `a-b` range, or empty for all ports
    #[serde(default)]
    pub dst_port: String,
}

impl BlockRule {
    pub fn normalize(&mut self) -> Result<()> {
        self.base.normalize()?;
        if self.dst.address("Dst")?.is_none() {
            return Err(Error::validation("Dst.IP", "required, 0.0.0.0/0 for any destination"));
        }
        validators::parse_port_spec(&self.dst_port).map_err(|e| Error::validation("DstPort", e))?;
        Ok(())
    }
}

/// Empty, `null` and missing all mean "no protocol given".
fn optional_protocol<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Protocol>, D::Error> {
    let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(None);
    }
    text.trim()
        .parse::<Protocol>()
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("unknown protocol '{text}', expected tcp or udp")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardRule {
    #[serde(flatten)]
    pub base: RuleBase,
    /// Required for DNAT rules. Interface rules without one cover tcp and udp.
    #[serde(
        default,
        deserialize_with = "optional_protocol",
        skip_serializing_if = "Option::is_none"
    )]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub original_dst: Destination,
    /// Single port, `a-b` range, or empty for all ports
    #[serde(default)]
    pub original_dst_port: String,
    #[serde(default)]
    pub dst: Destination,
    #[serde(default)]
    pub dst_port: String,
    /// When set, traffic is steered to this interface instead of rewritten
    #[serde(default)]
    pub dst_interface: String,
}

impl ForwardRule {
    /// Protocol maps this rule is compiled into.
    pub fn protocols(&self) -> Vec<Protocol> {
        match self.protocol {
            Some(protocol) => vec![protocol],
            None => Protocol::iter().collect(),
        }
    }

    /// `OriginalDstPort` as an inclusive range. Empty covers every port.
    pub fn original_port_range(&self) -> std::result::Result<(u16, u16), String> {
        validators::parse_port_spec(&self.original_dst_port).map(|range| range.unwrap_or((0, u16::MAX)))
    }

    pub fn normalize(&mut self) -> Result<()> {
        self.base.normalize()?;

        if self.original_dst.address("OriginalDst")?.is_none() {
            return Err(Error::validation(
                "OriginalDst.IP",
                "required, 0.0.0.0/0 for any destination",
            ));
        }
        let original = self
            .original_port_range()
            .map_err(|e| Error::validation("OriginalDstPort", e))?;

        validators::validate_interface(&self.dst_interface)
            .map_err(|e| Error::validation("DstInterface", e))?;

        if !self.dst_interface.is_empty() {
            self.dst.address("Dst")?;
            return Ok(());
        }

        if self.protocol.is_none() {
            return Err(Error::validation("Protocol", "required when DstInterface is empty"));
        }
        let Some(dst) = self.dst.address("Dst")? else {
            return Err(Error::validation(
                "Dst.IP",
                "required when DstInterface is empty",
            ));
        };
        let host_prefix = if dst.is_ipv4() { 32 } else { 128 };
        if dst.prefix() != host_prefix || dst.ip().is_unspecified() {
            return Err(Error::validation("Dst.IP", "must be a single address"));
        }
        match validators::parse_port_spec(&self.dst_port)
            .map_err(|e| Error::validation("DstPort", e))?
        {
            Some((a, b)) if a != b => Err(Error::validation("DstPort", "must be a single port")),
            None if original.0 != original.1 => Err(Error::validation(
                "DstPort",
                "required when OriginalDstPort is a range or empty",
            )),
            _ => Ok(()),
        }
    }
}

/// Applies tags to matching clients while active
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TagRule {
    #[serde(flatten)]
    pub base: RuleBase,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TagRule {
    pub fn normalize(&mut self) -> Result<()> {
        self.base.normalize()?;
        validate_names("Tags", &self.tags)
    }
}

/// Adds matching clients to groups while active
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct GroupRule {
    #[serde(flatten)]
    pub base: RuleBase,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl GroupRule {
    pub fn normalize(&mut self) -> Result<()> {
        self.base.normalize()?;
        validate_names("Groups", &self.groups)
    }
}

fn validate_names(field: &str, names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(Error::validation(field, "at least one entry is required"));
    }
    for name in names {
        if name.trim().is_empty() {
            return Err(Error::validation(field, "entries cannot be empty"));
        }
        validators::validate_label(name).map_err(|e| Error::validation(field, e))?;
    }
    Ok(())
}

/// WireGuard site-to-site tunnel; entry `i` is interface `site{i}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SiteVpn {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub peer_public_key: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub preshared_key: String,
    #[serde(default)]
    pub endpoint: String,
}

impl SiteVpn {
    pub fn interface_name(index: usize) -> String {
        format!("site{index}")
    }

    pub fn normalize(&self) -> Result<()> {
        validators::parse_address(&self.address).map_err(|e| Error::validation("Address", e))?;
        if self.peer_public_key.trim().is_empty() {
            return Err(Error::validation("PeerPublicKey", "required"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::validation("Endpoint", "required"));
        }
        Ok(())
    }

    pub fn masked(&self) -> Self {
        let mask = |s: &str| {
            if s.is_empty() {
                String::new()
            } else {
                MASKED.to_string()
            }
        };
        Self {
            private_key: mask(&self.private_key),
            preshared_key: mask(&self.preshared_key),
            ..self.clone()
        }
    }

    /// Keeps the stored secrets wherever the update echoes the mask back.
    pub fn keep_secrets_from(&mut self, stored: &SiteVpn) {
        if self.private_key == MASKED {
            self.private_key.clone_from(&stored.private_key);
        }
        if self.preshared_key == MASKED {
            self.preshared_key.clone_from(&stored.preshared_key);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Config projection
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardRule>,
    #[serde(default)]
    pub block_rules: Vec<BlockRule>,
    #[serde(default)]
    pub tag_rules: Vec<TagRule>,
    #[serde(default)]
    pub group_rules: Vec<GroupRule>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(rename = "SiteVPNs", default)]
    pub site_vpns: Vec<SiteVpn>,
    #[serde(rename = "APIToken", default)]
    pub api_token: String,
}

impl Config {
    /// Projection safe to hand to API callers.
    pub fn masked(&self) -> Self {
        Self {
            site_vpns: self.site_vpns.iter().map(SiteVpn::masked).collect(),
            api_token: MASKED.to_string(),
            ..self.clone()
        }
    }
}
