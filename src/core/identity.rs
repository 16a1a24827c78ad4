//! Client identity resolution against the device directory
//!
//! Devices, groups and endpoints belong to a sibling inventory service. The
//! compiler only needs a point-in-time [`DirectorySnapshot`] of it, obtained
//! through the [`Directory`] trait.
//!
//! Resolution never fails a save: a client that matches nothing resolves to
//! an empty address list and the compiler reports it as a warning.

use crate::core::rules::{Client, ClientMatch};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Groups every installation has, whether or not the directory lists them
pub const BUILTIN_GROUPS: [&str; 3] = ["lan", "wan", "dns"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "MAC", default)]
    pub mac: String,
    #[serde(rename = "RecentIP", default)]
    pub recent_ip: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub device_tags: Vec<String>,
}

impl Device {
    fn address(&self) -> Option<IpNetwork> {
        if self.recent_ip.is_empty() {
            return None;
        }
        validators::parse_address(&self.recent_ip).ok()
    }
}

/// Named destination/source from the firewall endpoint list
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DirectorySnapshot {
    /// Keyed by MAC address
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl DirectorySnapshot {
    pub fn is_known_group(&self, name: &str) -> bool {
        BUILTIN_GROUPS.contains(&name)
            || self.groups.iter().any(|g| g == name)
            || self
                .devices
                .values()
                .any(|d| d.groups.iter().any(|g| g == name))
    }
}

/// Source of device/group/endpoint data
pub trait Directory: Send + Sync {
    fn snapshot(&self) -> DirectorySnapshot;
}

/// In-memory directory, replaced wholesale
#[derive(Debug, Default)]
pub struct StaticDirectory {
    inner: RwLock<DirectorySnapshot>,
}

impl StaticDirectory {
    pub fn new(snapshot: DirectorySnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: DirectorySnapshot) {
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl Directory for StaticDirectory {
    fn snapshot(&self) -> DirectorySnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Directory exported by the inventory service as a JSON file. The parsed
/// file is cached until its modification time changes, so device IP changes
/// show up on the next compile.
///
/// [`Directory::snapshot`] touches the filesystem. Async callers go through
/// [`crate::core::store::RuleStore::directory`], which runs it on the
/// blocking pool.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    cache: Mutex<Option<(SystemTime, DirectorySnapshot)>>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    fn read(&self) -> DirectorySnapshot {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) => {
                debug!(path = %self.path.display(), "directory unavailable: {e}");
                return DirectorySnapshot::default();
            }
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), "ignoring malformed directory: {e}");
            DirectorySnapshot::default()
        })
    }
}

impl Directory for FileDirectory {
    fn snapshot(&self) -> DirectorySnapshot {
        let Ok(modified) = std::fs::metadata(&self.path).and_then(|m| m.modified()) else {
            return self.read();
        };
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((stamp, snapshot)) = cache.as_ref()
            && *stamp == modified
        {
            return snapshot.clone();
        }
        let snapshot = self.read();
        *cache = Some((modified, snapshot.clone()));
        snapshot
    }
}

/// Classifies free text: dotted quad, then known group, then identity.
pub fn classify(text: &str, snapshot: &DirectorySnapshot) -> Client {
    let text = text.trim();
    if text.is_empty() {
        return Client::any();
    }
    if validators::is_dotted_quad(text) {
        return Client::src_ip(text);
    }
    if snapshot.is_known_group(text) {
        return Client::group(text);
    }
    Client::identity(text)
}

/// Finalises a client that arrived as a bare string.
pub fn settle(client: &mut Client, snapshot: &DirectorySnapshot) {
    if client.is_unclassified() {
        *client = classify(&client.identity, snapshot);
    }
}

/// Outcome of resolving a client selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Any,
    /// Sorted, deduplicated; empty means "no matching clients"
    Addresses(Vec<IpNetwork>),
}

/// Resolves selectors against a snapshot plus memberships granted by
/// active tag and group rules.
#[derive(Debug)]
pub struct Resolver<'a> {
    snapshot: &'a DirectorySnapshot,
    granted_tags: BTreeMap<String, BTreeSet<(std::net::IpAddr, u8)>>,
    granted_groups: BTreeMap<String, BTreeSet<(std::net::IpAddr, u8)>>,
}

impl<'a> Resolver<'a> {
    pub fn new(snapshot: &'a DirectorySnapshot) -> Self {
        Self {
            snapshot,
            granted_tags: BTreeMap::new(),
            granted_groups: BTreeMap::new(),
        }
    }

    pub fn grant_tag(&mut self, tag: &str, addresses: &[IpNetwork]) {
        let entry = self.granted_tags.entry(tag.to_string()).or_default();
        entry.extend(addresses.iter().map(|n| (n.ip(), n.prefix())));
    }

    pub fn grant_group(&mut self, group: &str, addresses: &[IpNetwork]) {
        let entry = self.granted_groups.entry(group.to_string()).or_default();
        entry.extend(addresses.iter().map(|n| (n.ip(), n.prefix())));
    }

    pub fn resolve(&self, selector: &ClientMatch) -> Resolved {
        let mut found: Vec<IpNetwork> = match selector {
            ClientMatch::Any => return Resolved::Any,
            ClientMatch::SrcIp(net) => vec![*net],
            ClientMatch::Group(group) => self
                .devices_where(|d| d.groups.iter().any(|g| g == group))
                .chain(granted(&self.granted_groups, group))
                .collect(),
            ClientMatch::Tag(tag) => self
                .devices_where(|d| d.device_tags.iter().any(|t| t == tag))
                .chain(granted(&self.granted_tags, tag))
                .collect(),
            ClientMatch::Identity(name) => self
                .devices_where(|d| d.name == *name || d.mac.eq_ignore_ascii_case(name))
                .collect(),
            ClientMatch::Endpoint(name) => self
                .snapshot
                .endpoints
                .iter()
                .filter(|e| e.rule_name == *name && !e.ip.is_empty())
                .filter_map(|e| validators::parse_address(&e.ip).ok())
                .collect(),
        };
        found.sort_by_key(|n| (n.ip(), n.prefix()));
        found.dedup();
        Resolved::Addresses(found)
    }

    fn devices_where<'s, F>(&'s self, pred: F) -> impl Iterator<Item = IpNetwork> + 's
    where
        F: Fn(&Device) -> bool + 's,
    {
        self.snapshot
            .devices
            .values()
            .filter(move |d| pred(d))
            .filter_map(Device::address)
    }
}

fn granted<'m>(
    grants: &'m BTreeMap<String, BTreeSet<(std::net::IpAddr, u8)>>,
    key: &str,
) -> impl Iterator<Item = IpNetwork> + 'm {
    grants
        .get(key)
        .into_iter()
        .flatten()
        .filter_map(|(ip, prefix)| IpNetwork::new(*ip, *prefix).ok())
}
