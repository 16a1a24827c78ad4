//! Service settings and persisted rule state
//!
//! `config.json` holds how the daemon runs (listen address, compile mode,
//! credentials). The rule state file holds what it enforces and is rewritten
//! after every accepted mutation.

use crate::core::engine::{CompileMode, MAX_DEBOUNCE};
use crate::core::error::{Error, Result};
use crate::core::nft_json::ApplyMode;
use crate::core::store::PersistedState;
use crate::utils::{get_config_dir, get_state_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Credentials accepted on mutating requests
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    /// Bearer tokens
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Basic auth users: name → password
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.users.is_empty()
    }
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Device directory exported by the inventory service
    #[serde(default)]
    pub directory_path: Option<PathBuf>,
    #[serde(default)]
    pub compile_mode: CompileMode,
    /// Clamped to 1000 ms
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub apply: ApplyMode,
    #[serde(default = "default_nft_path")]
    pub nft_path: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_path: default_state_path(),
            directory_path: None,
            compile_mode: CompileMode::default(),
            debounce_ms: default_debounce_ms(),
            apply: ApplyMode::default(),
            nft_path: default_nft_path(),
            auth: AuthConfig::default(),
            log_level: default_log_level(),
            log_file: None,
            audit_log: true,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_state_path() -> PathBuf {
    get_state_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pfw.json")
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_nft_path() -> String {
    "nft".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl ServiceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms).min(MAX_DEBOUNCE)
    }

    pub fn default_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&json)?;
        if Duration::from_millis(config.debounce_ms) > MAX_DEBOUNCE {
            warn!(
                debounce_ms = config.debounce_ms,
                "debounce_ms clamped to {}",
                MAX_DEBOUNCE.as_millis()
            );
        }
        Ok(config)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rule state persistence
// ═══════════════════════════════════════════════════════════════════════════

/// Saves the rule state using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600); the file carries secrets.
/// 3. Atomically renames to the target path.
pub async fn save_state(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &json))
        .await
        .map_err(|e| Error::Internal(format!("state writer panicked: {e}")))??;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::Builder::new()
        .prefix(".pfw-state")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(bytes)?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save rule state. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Loads the rule state; a missing file is an empty state.
///
/// # Errors
///
/// Returns `Err` if the file exists but is unreadable or malformed. The
/// daemon refuses to start rather than overwrite rules it could not parse.
pub async fn load_state(path: &Path) -> Result<PersistedState> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::{BlockRule, Client, Destination, Protocol, RuleBase};

    #[test]
    fn test_service_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.compile_mode, CompileMode::Debounce);
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.apply, ApplyMode::DryRun);
        assert!(config.audit_log);
        assert!(config.auth.is_empty());
    }

    #[test]
    fn test_service_config_parsing() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "listen": "0.0.0.0:9000",
                "compile_mode": "sync",
                "debounce_ms": 5000,
                "apply": "nft",
                "auth": {"tokens": ["abc"], "users": {"admin": "pw"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.compile_mode, CompileMode::Sync);
        assert_eq!(config.apply, ApplyMode::Nft);
        assert_eq!(config.debounce(), MAX_DEBOUNCE);
        assert_eq!(config.auth.users["admin"], "pw");
    }

    #[tokio::test]
    async fn test_missing_files_are_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config, ServiceConfig::default());
        let state = load_state(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pfw.json");

        let mut state = PersistedState::default();
        state.pfw.api_token = "secret".to_string();
        state.pfw.block_rules.push(BlockRule {
            base: RuleBase {
                client: Client::src_ip("0.0.0.0"),
                ..RuleBase::named("Block TCP test")
            },
            protocol: Protocol::Tcp,
            dst: Destination::new("1.2.3.4"),
            dst_port: String::new(),
        });

        save_state(&path, &state).await.unwrap();
        let loaded = load_state(&path).await.unwrap();
        assert_eq!(loaded, state);

        // Stored with the real token, wire names preserved
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"APIToken\": \"secret\""));
        assert!(raw.contains("\"BlockRules\""));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_malformed_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pfw.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_state(&path).await, Err(Error::Serialization(_))));
    }
}
