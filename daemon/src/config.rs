use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::window_monitor::WindowWatchConfig;

pub const DEFAULT_INTERFACE: &str = "awdl0";
pub const DEFAULT_BUNDLE_ID: &str = "com.nvidia.gfnpc.mall";
pub const DEFAULT_PROCESS_NAME: &str = "GeForceNOW";
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_FULLSCREEN_TOLERANCE: f64 = 1.0;

/// Daemon configuration. Deserialized from `<data dir>/config.toml`; every
/// field is optional.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Interface held down while streaming.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Bundle identifier of the streaming application.
    #[serde(default = "default_bundle_id")]
    pub target_bundle_id: String,
    /// Executable name matched by the polling process watcher.
    #[serde(default = "default_process_name")]
    pub target_process_name: String,
    /// Seconds between full-screen checks. Clamped to [1, 60].
    #[serde(default = "default_poll_interval")]
    pub window_poll_interval_secs: u64,
    /// Allowed deviation, in points, between window and display edges.
    #[serde(default = "default_tolerance")]
    pub fullscreen_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            target_bundle_id: DEFAULT_BUNDLE_ID.to_string(),
            target_process_name: DEFAULT_PROCESS_NAME.to_string(),
            window_poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            fullscreen_tolerance: DEFAULT_FULLSCREEN_TOLERANCE,
        }
    }
}

/// Identity of the application whose lifecycle is tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub bundle_id: String,
    pub process_name: String,
}

impl Config {
    /// Returns the interface to guard; `cli_override` wins over the file.
    pub fn effective_interface<'a>(&'a self, cli_override: Option<&'a str>) -> &'a str {
        cli_override.unwrap_or(&self.interface)
    }

    pub fn target(&self) -> TargetConfig {
        TargetConfig {
            bundle_id: self.target_bundle_id.clone(),
            process_name: self.target_process_name.clone(),
        }
    }

    /// Window watcher settings with out-of-range values clamped.
    pub fn window_watch(&self) -> WindowWatchConfig {
        let secs = self
            .window_poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        WindowWatchConfig {
            interval: Duration::from_secs(secs),
            tolerance: self.fullscreen_tolerance.max(0.0),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_bundle_id() -> String {
    DEFAULT_BUNDLE_ID.to_string()
}

fn default_process_name() -> String {
    DEFAULT_PROCESS_NAME.to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_tolerance() -> f64 {
    DEFAULT_FULLSCREEN_TOLERANCE
}
