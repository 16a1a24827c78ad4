/// Audit logging for rule mutations
///
/// Every mutating API call appends one JSON line describing what changed,
/// whether it succeeded, and why not if it failed.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AddRule,
    UpdateRule,
    DeleteRule,
    SetVariable,
    DeleteVariable,
    SetToken,
    ConfigureTask,
    RunTask,
    AddFirewallRule,
    DeleteFirewallRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub id: Uuid,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            id: Uuid::new_v4(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
    // Serializes appends so lines from concurrent requests never interleave
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Audit log at `<state dir>/audit.log`
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn in_state_dir() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");
        Ok(Self::new(log_path))
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Records an event, logging instead of failing when the write fails.
    pub async fn record(
        &self,
        event_type: EventType,
        details: serde_json::Value,
        outcome: Result<(), String>,
    ) {
        let (success, error) = match outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        let event = AuditEvent::new(event_type, success, details, error);
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
