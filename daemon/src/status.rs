use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::event::Pid;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// The target application is not running.
    Idle,
    /// The target application is running but not full-screen.
    Tracking,
    /// The target application is streaming; the interface is held down.
    Streaming,
}

/// Runtime status written by the daemon to `<data dir>/status.toml`.
/// `awdl-guard status` reads this file to report daemon state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Interface being guarded.
    pub interface: String,
    pub state: DaemonState,
    /// Pid of the tracked application, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_pid: Option<Pid>,
    /// RFC 3339 timestamp of the most recent state change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<String>,
    /// Most recent actuation error, cleared by the next successful one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new(interface: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            interface: interface.to_string(),
            state: DaemonState::Idle,
            tracked_pid: None,
            last_transition: None,
            error: None,
        }
    }

    /// Sets the state and stamps the transition time.
    pub fn transition(&mut self, state: DaemonState, tracked_pid: Option<Pid>) {
        self.state = state;
        self.tracked_pid = tracked_pid;
        self.last_transition = Some(chrono::Local::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), error = %e, "failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize status"),
    }
}

/// Reads a status file written by [`write_status`]; `None` when absent.
pub fn read_status(path: &Path) -> Result<Option<DaemonStatus>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read status file: {}", path.display()))?;
    let status = toml::from_str(&content)
        .with_context(|| format!("Failed to parse status file: {}", path.display()))?;
    Ok(Some(status))
}
