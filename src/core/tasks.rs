//! Periodic task settings (`wifi-scan`, `uplink-check`)
//!
//! pfw only stores the schedule and parameters; the scan and probe
//! themselves are run by the sibling services that read this config.

use crate::core::error::{Error, Result};
use crate::core::schedule::validate_cron;
use crate::validators;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTime {
    #[serde(default)]
    pub cron_expr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct WifiScanTask {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub time: TaskTime,
}

impl Default for WifiScanTask {
    fn default() -> Self {
        Self {
            disabled: true,
            interfaces: Vec::new(),
            time: TaskTime {
                cron_expr: "0 * * * *".to_string(),
            },
        }
    }
}

/// `Addresses` entries are `icmp:<ip>` or `tcp:<ip>:<port>`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UplinkCheckTask {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub time: TaskTime,
}

impl Default for UplinkCheckTask {
    fn default() -> Self {
        Self {
            disabled: true,
            addresses: Vec::new(),
            time: TaskTime {
                cron_expr: "*/5 * * * *".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskConfig {
    #[serde(rename = "WiFiScan", default)]
    pub wifi_scan: WifiScanTask,
    #[serde(default)]
    pub uplink_check: UplinkCheckTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter)]
pub enum TaskName {
    #[strum(serialize = "wifi-scan")]
    WifiScan,
    #[strum(serialize = "uplink-check")]
    UplinkCheck,
}

impl TaskName {
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::not_found(format!("task '{name}'")))
    }
}

impl WifiScanTask {
    pub fn validate(&self) -> Result<()> {
        validate_cron(&self.time.cron_expr)?;
        if !self.disabled && self.interfaces.is_empty() {
            return Err(Error::validation("Interfaces", "at least one interface is required"));
        }
        for iface in &self.interfaces {
            if iface.is_empty() {
                return Err(Error::validation("Interfaces", "entries cannot be empty"));
            }
            validators::validate_interface(iface).map_err(|e| Error::validation("Interfaces", e))?;
        }
        Ok(())
    }
}

impl UplinkCheckTask {
    pub fn validate(&self) -> Result<()> {
        validate_cron(&self.time.cron_expr)?;
        for address in &self.addresses {
            validate_probe(address)?;
        }
        Ok(())
    }
}

fn validate_probe(address: &str) -> Result<()> {
    let invalid = |msg: &str| Error::validation("Addresses", format!("'{address}': {msg}"));
    let mut pieces = address.splitn(3, ':');
    let kind = pieces.next().unwrap_or_default();
    let ip = pieces.next().ok_or_else(|| invalid("missing address"))?;
    validators::parse_address(ip).map_err(|e| invalid(&e))?;
    match (kind, pieces.next()) {
        ("icmp", None) => Ok(()),
        ("tcp", Some(port)) => match validators::parse_port_spec(port) {
            Ok(Some((a, b))) if a == b && a != 0 => Ok(()),
            _ => Err(invalid("invalid port")),
        },
        ("tcp", None) => Err(invalid("tcp checks need a port")),
        _ => Err(invalid("expected icmp:<ip> or tcp:<ip>:<port>")),
    }
}

impl TaskConfig {
    /// Replaces one task's settings from a JSON document.
    pub fn configure(&mut self, task: TaskName, body: serde_json::Value) -> Result<()> {
        match task {
            TaskName::WifiScan => {
                let parsed: WifiScanTask = serde_json::from_value(body)
                    .map_err(|e| Error::validation("body", e.to_string()))?;
                parsed.validate()?;
                self.wifi_scan = parsed;
            }
            TaskName::UplinkCheck => {
                let parsed: UplinkCheckTask = serde_json::from_value(body)
                    .map_err(|e| Error::validation("body", e.to_string()))?;
                parsed.validate()?;
                self.uplink_check = parsed;
            }
        }
        Ok(())
    }

    pub fn is_disabled(&self, task: TaskName) -> bool {
        match task {
            TaskName::WifiScan => self.wifi_scan.disabled,
            TaskName::UplinkCheck => self.uplink_check.disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_names() {
        assert_eq!(TaskName::parse("wifi-scan").unwrap(), TaskName::WifiScan);
        assert_eq!(TaskName::UplinkCheck.to_string(), "uplink-check");
        assert!(matches!(TaskName::parse("reboot"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(TaskConfig::default()).unwrap();
        assert_eq!(value["WiFiScan"]["Disabled"], true);
        assert_eq!(value["WiFiScan"]["Time"]["CronExpr"], "0 * * * *");
        assert!(value["UplinkCheck"]["Addresses"].is_array());
    }

    #[test]
    fn test_configure_wifi_scan() {
        let mut config = TaskConfig::default();
        config
            .configure(
                TaskName::WifiScan,
                json!({"Disabled": false, "Interfaces": ["wlan1"], "Time": {"CronExpr": "*/15 * * * *"}}),
            )
            .unwrap();
        assert!(!config.is_disabled(TaskName::WifiScan));
        assert_eq!(config.wifi_scan.interfaces, vec!["wlan1"]);

        let err = config.configure(
            TaskName::WifiScan,
            json!({"Disabled": false, "Interfaces": [], "Time": {"CronExpr": "0 * * * *"}}),
        );
        assert!(err.is_err());
        // Rejected documents leave the stored settings alone
        assert_eq!(config.wifi_scan.interfaces, vec!["wlan1"]);
    }

    #[test]
    fn test_configure_uplink_check() {
        let mut config = TaskConfig::default();
        let ok = json!({"Addresses": ["icmp:1.1.1.1", "tcp:8.8.8.8:53"], "Time": {"CronExpr": "0,30 * * * *"}});
        assert!(config.configure(TaskName::UplinkCheck, ok).is_ok());

        for bad in ["tcp:8.8.8.8", "dns:8.8.8.8", "icmp:host", "tcp:1.1.1.1:0"] {
            let doc = json!({"Addresses": [bad], "Time": {"CronExpr": "0 * * * *"}});
            assert!(config.configure(TaskName::UplinkCheck, doc).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_configure_rejects_bad_cron() {
        let mut config = TaskConfig::default();
        let doc = json!({"Disabled": true, "Time": {"CronExpr": "every hour"}});
        assert!(config.configure(TaskName::WifiScan, doc).is_err());
    }
}
