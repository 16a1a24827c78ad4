//! nftables JSON for compiled maps
//!
//! pfw never touches chains or rules: the base ruleset declares lookups into
//! named maps and pfw keeps their elements current. A batch re-declares every
//! map (idempotent `add`), flushes it, then adds the compiled elements, so nft
//! swaps the whole state in one transaction.

use crate::core::error::{Error, NftablesErrorPattern, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

/// A named nftables map and its compiled elements
#[derive(Debug, Clone, PartialEq)]
pub struct NftMap {
    pub family: &'static str,
    pub table: &'static str,
    pub name: String,
    /// One entry per concatenated key component
    pub key_type: Vec<&'static str>,
    pub value_type: Vec<&'static str>,
    pub interval: bool,
    pub elements: Vec<(Value, Value)>,
}

impl NftMap {
    pub fn new(
        table: &'static str,
        name: impl Into<String>,
        key_type: &[&'static str],
        value_type: &[&'static str],
    ) -> Self {
        Self {
            family: "inet",
            table,
            name: name.into(),
            key_type: key_type.to_vec(),
            value_type: value_type.to_vec(),
            interval: true,
            elements: Vec::new(),
        }
    }

    pub fn exact(mut self) -> Self {
        self.interval = false;
        self
    }

    pub fn push(&mut self, key: Value, value: Value) {
        self.elements.push((key, value));
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn type_json(types: &[&'static str]) -> Value {
        match types {
            [single] => json!(single),
            many => json!(many),
        }
    }

    fn elem_json(&self) -> Value {
        Value::Array(
            self.elements
                .iter()
                .map(|(k, v)| json!([k, v]))
                .collect(),
        )
    }

    fn object(&self) -> Value {
        json!({
            "family": self.family,
            "table": self.table,
            "name": self.name,
        })
    }

    /// `add map` body
    pub fn declaration(&self) -> Value {
        let mut decl = self.object();
        decl["type"] = Self::type_json(&self.key_type);
        decl["map"] = Self::type_json(&self.value_type);
        if self.interval {
            decl["flags"] = json!(["interval"]);
        }
        decl
    }

    /// Same shape as `nft -j list map <family> <table> <name>`; `elem` is
    /// absent when the map is empty.
    pub fn to_list_json(&self) -> Value {
        let mut map = self.declaration();
        if !self.elements.is_empty() {
            map["elem"] = self.elem_json();
        }
        json!({
            "nftables": [
                { "metainfo": { "json_schema_version": 1 } },
                { "map": map },
            ]
        })
    }
}

/// Builds the replace-everything batch for a set of maps.
pub fn batch<'a>(maps: impl IntoIterator<Item = &'a NftMap>) -> Value {
    let maps: Vec<&NftMap> = maps.into_iter().collect();
    let mut commands = Vec::new();

    let mut tables: Vec<(&str, &str)> = maps.iter().map(|m| (m.family, m.table)).collect();
    tables.sort_unstable();
    tables.dedup();
    for (family, name) in tables {
        commands.push(json!({ "add": { "table": { "family": family, "name": name } } }));
    }

    for map in &maps {
        commands.push(json!({ "add": { "map": map.declaration() } }));
        commands.push(json!({ "flush": { "map": map.object() } }));
        if !map.is_empty() {
            let mut element = map.object();
            element["elem"] = map.elem_json();
            commands.push(json!({ "add": { "element": element } }));
        }
    }

    json!({ "nftables": commands })
}

/// Computes SHA-256 checksum of a JSON value.
///
/// The checksum is computed on the canonical JSON string representation.
pub fn compute_checksum(value: &Value) -> String {
    let json_str = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════
// Key components
// ═══════════════════════════════════════════════════════════════════════════

/// Address component: bare address for hosts, prefix object for networks.
pub fn addr_json(net: &ipnetwork::IpNetwork) -> Value {
    let host_prefix = if net.is_ipv4() { 32 } else { 128 };
    if net.prefix() == host_prefix {
        json!(net.ip().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
    }
}

/// Port component: number for a single port, range object otherwise.
pub fn port_json(start: u16, end: u16) -> Value {
    if start == end {
        json!(start)
    } else {
        json!({ "range": [start, end] })
    }
}

/// Concatenated key; a single component stays bare.
pub fn concat(parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or(Value::Null)
    } else {
        json!({ "concat": parts })
    }
}

pub fn verdict(name: &str) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(name.to_string(), Value::Null);
    Value::Object(object)
}

// ═══════════════════════════════════════════════════════════════════════════
// Applying
// ═══════════════════════════════════════════════════════════════════════════

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApplyMode {
    /// Compile and keep the result in memory only
    #[default]
    DryRun,
    /// Pipe the batch into `nft --json -f -`
    Nft,
}

#[derive(Debug, Clone)]
pub struct NftApplier {
    mode: ApplyMode,
    program: String,
    args: Vec<String>,
}

impl NftApplier {
    /// `PFW_NFT_COMMAND` overrides `nft_path` when set.
    pub fn new(mode: ApplyMode, nft_path: &str) -> Self {
        let program = std::env::var("PFW_NFT_COMMAND")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| nft_path.to_string());
        Self::with_command(mode, program, ["--json", "-f", "-"])
    }

    pub fn with_command<I, S>(mode: ApplyMode, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    pub async fn apply(&self, batch: &Value) -> Result<()> {
        if self.mode == ApplyMode::DryRun {
            debug!("dry-run: skipping nft apply");
            return Ok(());
        }

        let json_string = serde_json::to_string(batch)?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Nftables {
                    message: format!("Failed to spawn {}: {e}", self.program),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        // stdin is closed at the end of the match so nft sees EOF
        let write_error = match child.stdin.take() {
            Some(mut stdin) => {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(json_string.as_bytes()).await.err()
            }
            None => None,
        };

        // Always reaped, even when nft stopped reading early
        let output = child.wait_with_output().await?;

        if let Some(e) = write_error {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!(status = %output.status, "Failed to write batch to {}: {e}", self.program);
            return Err(Error::Nftables {
                message: format!("Failed to write batch to {}: {e}", self.program),
                stderr: (!stderr.is_empty()).then_some(stderr),
                exit_code: output.status.code(),
            });
        }

        if output.status.success() {
            info!("nft batch applied");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let translation = NftablesErrorPattern::match_error(&stderr);
            error!(
                suggestions = ?translation.suggestions,
                "{}: {stderr}",
                translation.user_message
            );
            Err(Error::Nftables {
                message: translation.user_message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dnat_map() -> NftMap {
        NftMap::new(
            "nat",
            "dnat_tcp_ipmap",
            &["ipv4_addr", "ipv4_addr", "inet_service"],
            &["ipv4_addr"],
        )
    }

    #[test]
    fn test_empty_map_has_no_elem() {
        let json = dnat_map().to_list_json();
        let map = &json["nftables"][1]["map"];
        assert_eq!(map["name"], "dnat_tcp_ipmap");
        assert_eq!(map["table"], "nat");
        assert_eq!(map["family"], "inet");
        assert_eq!(map["map"], "ipv4_addr");
        assert_eq!(map["flags"], json!(["interval"]));
        assert!(map.get("elem").is_none());
        assert_eq!(json["nftables"][0]["metainfo"]["json_schema_version"], 1);
    }

    #[test]
    fn test_list_json_elements() {
        let mut map = dnat_map();
        map.push(
            concat(vec![json!("0.0.0.0"), json!("192.168.1.10"), port_json(80, 80)]),
            json!("192.168.2.20"),
        );
        let json = map.to_list_json();
        let elem = &json["nftables"][1]["map"]["elem"];
        assert_eq!(elem[0][0]["concat"], json!(["0.0.0.0", "192.168.1.10", 80]));
        assert_eq!(elem[0][1], "192.168.2.20");
    }

    #[test]
    fn test_key_components() {
        let host: ipnetwork::IpNetwork = "10.0.0.1".parse().unwrap();
        assert_eq!(addr_json(&host), json!("10.0.0.1"));
        let net: ipnetwork::IpNetwork = "10.0.0.77/24".parse().unwrap();
        assert_eq!(addr_json(&net), json!({"prefix": {"addr": "10.0.0.0", "len": 24}}));
        assert_eq!(port_json(53, 53), json!(53));
        assert_eq!(port_json(0, 65535), json!({"range": [0, 65535]}));
        assert_eq!(concat(vec![json!(22)]), json!(22));
        assert_eq!(verdict("drop"), json!({"drop": null}));
    }

    #[test]
    fn test_batch_structure() {
        let mut full = dnat_map();
        full.push(json!("k"), json!("v"));
        let empty = NftMap::new("filter", "pfw_block_udp", &["ipv4_addr"], &["verdict"]).exact();

        let batch = batch([&full, &empty]);
        let commands = batch["nftables"].as_array().unwrap();

        // 2 tables, then add+flush+element for the full map and add+flush for the empty one
        assert_eq!(commands.len(), 7);
        assert_eq!(commands[0]["add"]["table"]["name"], "filter");
        assert_eq!(commands[1]["add"]["table"]["name"], "nat");
        assert_eq!(commands[2]["add"]["map"]["name"], "dnat_tcp_ipmap");
        assert_eq!(commands[3]["flush"]["map"]["name"], "dnat_tcp_ipmap");
        assert_eq!(commands[4]["add"]["element"]["elem"], json!([["k", "v"]]));
        assert_eq!(commands[5]["add"]["map"]["name"], "pfw_block_udp");
        assert!(commands[5]["add"]["map"].get("flags").is_none());
        assert!(commands[6].get("flush").is_some());
    }

    #[test]
    fn test_compute_checksum_deterministic() {
        let value = batch([&dnat_map()]);
        let checksum1 = compute_checksum(&value);
        let checksum2 = compute_checksum(&value);
        assert_eq!(checksum1, checksum2);
        assert_eq!(checksum1.len(), 64);
    }

    #[test]
    fn test_compute_checksum_different_inputs() {
        let mut other = dnat_map();
        other.push(json!(1), json!(2));
        assert_ne!(
            compute_checksum(&batch([&dnat_map()])),
            compute_checksum(&batch([&other]))
        );
    }

    #[tokio::test]
    async fn test_dry_run_apply() {
        let applier = NftApplier::with_command(ApplyMode::DryRun, "/nonexistent/nft", ["-f", "-"]);
        assert!(applier.apply(&batch([&dnat_map()])).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_pipes_batch() {
        let applier = NftApplier::with_command(ApplyMode::Nft, "sh", ["-c", "cat > /dev/null"]);
        assert!(applier.apply(&batch([&dnat_map()])).await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_failure_translated() {
        let applier = NftApplier::with_command(
            ApplyMode::Nft,
            "sh",
            ["-c", "cat > /dev/null; echo 'Error: map dnat_tcp_ipmap does not exist' >&2; exit 1"],
        );
        let err = applier.apply(&batch([&dnat_map()])).await.unwrap_err();
        match err {
            Error::Nftables {
                message, exit_code, ..
            } => {
                assert_eq!(message, "Target map does not exist");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_apply_reaps_nft_that_stops_reading() {
        let applier = NftApplier::with_command(ApplyMode::Nft, "sh", ["-c", "exit 0"]);
        // Larger than any pipe buffer, so the write cannot complete
        let big = json!({ "nftables": vec![json!({"x": "y".repeat(64)}); 40_000] });
        match applier.apply(&big).await {
            Err(Error::Nftables {
                message, exit_code, ..
            }) => {
                assert!(message.starts_with("Failed to write batch"), "{message}");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_missing_binary() {
        let applier = NftApplier::with_command(ApplyMode::Nft, "/nonexistent/nft", ["-f", "-"]);
        assert!(matches!(
            applier.apply(&json!({})).await,
            Err(Error::Nftables { .. })
        ));
    }
}
