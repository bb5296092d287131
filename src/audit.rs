//! Audit logging for privileged operations
//!
//! Every CLI action that touches the kernel rule set appends one JSON line to
//! `$XDG_STATE_HOME/tunwall/audit.log`.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TunnelUp,
    TunnelDown,
    CheckRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

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
}

impl AuditLog {
    /// Audit log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.log_path)?;

        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        Ok(())
    }

    /// The most recent `count` events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.log_path)?;

        Ok(content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

fn record(event: &AuditEvent) {
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event)
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Logs a tunnel bring-up.
///
/// `fingerprint` is the SHA-256 of the rendered batch, when one was built.
pub fn log_up(
    interface: &str,
    rule_count: usize,
    fingerprint: Option<&str>,
    success: bool,
    error: Option<String>,
) {
    record(&AuditEvent::new(
        EventType::TunnelUp,
        success,
        serde_json::json!({
            "interface": interface,
            "rule_count": rule_count,
            "fingerprint": fingerprint,
        }),
        error,
    ));
}

pub fn log_down(success: bool, error: Option<String>) {
    record(&AuditEvent::new(
        EventType::TunnelDown,
        success,
        serde_json::json!({}),
        error,
    ));
}

pub fn log_check(fingerprint: &str, success: bool, error_count: usize, error: Option<String>) {
    record(&AuditEvent::new(
        EventType::CheckRules,
        success,
        serde_json::json!({
            "fingerprint": fingerprint,
            "error_count": error_count,
        }),
        error,
    ));
}
