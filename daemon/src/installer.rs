/// launchd registration of the daemon.
///
/// `install` copies the running binary under the prefix, writes a
/// LaunchDaemon descriptor and loads it; `uninstall` reverses that.  Both need
/// root and are only available on macOS.  `status` works everywhere and
/// reports what it can.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Config;
use crate::interface::{InterfaceActuator, InterfaceControl};
use crate::process_monitor;
use crate::status;

pub const SERVICE_LABEL: &str = "com.awdl-guard.daemon";
pub const DESCRIPTOR_PATH: &str = "/Library/LaunchDaemons/com.awdl-guard.daemon.plist";
pub const LOG_DIR: &str = "/var/log/awdl-guard";
pub const DEFAULT_PREFIX: &str = "/usr/local";
pub const BINARY_NAME: &str = "awdl-guard";
const THROTTLE_INTERVAL_SECS: u32 = 5;

#[derive(Debug, Error)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub enum InstallError {
    #[error("this command must be run as root (try sudo)")]
    NotRoot,

    #[error("service installation is only supported on macOS")]
    Unsupported,

    #[error("failed to locate the running executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run launchctl: {0}")]
    LaunchctlSpawn(#[source] io::Error),

    #[error("launchctl {action} failed: {stderr}")]
    Launchctl { action: &'static str, stderr: String },
}

/// Where an installation lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub binary: PathBuf,
    pub descriptor: PathBuf,
    pub log_dir: PathBuf,
}

impl Layout {
    pub fn new(prefix: &Path) -> Self {
        Self {
            binary: prefix.join("bin").join(BINARY_NAME),
            descriptor: PathBuf::from(DESCRIPTOR_PATH),
            log_dir: PathBuf::from(LOG_DIR),
        }
    }

    pub fn install_state(&self) -> InstallState {
        match (self.binary.exists(), self.descriptor.exists()) {
            (true, true) => InstallState::Installed,
            (false, false) => InstallState::NotInstalled,
            (binary, descriptor) => InstallState::Partial { binary, descriptor },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Installed,
    Partial { binary: bool, descriptor: bool },
    NotInstalled,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Installed => f.write_str("installed"),
            Self::Partial { binary, descriptor } => {
                write!(f, "partial (binary: {binary}, descriptor: {descriptor})")
            }
            Self::NotInstalled => f.write_str("not installed"),
        }
    }
}

/// The launchd property list that runs `<binary> run` at boot and keeps it alive.
pub fn service_descriptor(layout: &Layout) -> String {
    let binary = layout.binary.display();
    let log_dir = layout.log_dir.display();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{SERVICE_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{binary}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>ProcessType</key>
    <string>Background</string>
    <key>StandardOutPath</key>
    <string>{log_dir}/stdout.log</string>
    <key>StandardErrorPath</key>
    <string>{log_dir}/stderr.log</string>
    <key>ThrottleInterval</key>
    <integer>{THROTTLE_INTERVAL_SECS}</integer>
</dict>
</plist>
"#
    )
}

// ── macOS implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod imp {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::process::Command;

    use tracing::{debug, info, warn};

    use super::{service_descriptor, InstallError, Layout};

    fn require_root() -> Result<(), InstallError> {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err(InstallError::NotRoot);
        }
        Ok(())
    }

    fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
        move |source| InstallError::Write {
            path: path.to_path_buf(),
            source,
        }
    }

    fn launchctl(action: &'static str, descriptor: &Path) -> Result<(), InstallError> {
        debug!(action, "running launchctl");
        let mut cmd = Command::new("launchctl");
        cmd.arg(action);
        if action == "load" {
            cmd.arg("-w");
        }
        let output = cmd
            .arg(descriptor)
            .output()
            .map_err(InstallError::LaunchctlSpawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InstallError::Launchctl { action, stderr });
        }
        Ok(())
    }

    pub(super) fn install(layout: &Layout) -> Result<(), InstallError> {
        require_root()?;

        let exe = std::env::current_exe().map_err(InstallError::CurrentExe)?;
        if let Some(bin_dir) = layout.binary.parent() {
            fs::create_dir_all(bin_dir).map_err(write_err(bin_dir))?;
        }
        if exe != layout.binary {
            fs::copy(&exe, &layout.binary).map_err(write_err(&layout.binary))?;
        }
        fs::set_permissions(&layout.binary, fs::Permissions::from_mode(0o755))
            .map_err(write_err(&layout.binary))?;
        info!(path = %layout.binary.display(), "installed binary");

        fs::create_dir_all(&layout.log_dir).map_err(write_err(&layout.log_dir))?;

        if layout.descriptor.exists() {
            // Reinstall: replace the running definition.
            let _ = launchctl("unload", &layout.descriptor);
        }
        fs::write(&layout.descriptor, service_descriptor(layout))
            .map_err(write_err(&layout.descriptor))?;
        info!(path = %layout.descriptor.display(), "wrote service descriptor");

        launchctl("load", &layout.descriptor)?;
        info!("service loaded");
        Ok(())
    }

    pub(super) fn uninstall(layout: &Layout) -> Result<(), InstallError> {
        require_root()?;

        if layout.descriptor.exists() {
            if let Err(e) = launchctl("unload", &layout.descriptor) {
                warn!(error = %e, "unload failed, continuing");
            }
        }

        for path in [&layout.descriptor, &layout.binary] {
            if path.exists() {
                fs::remove_file(path).map_err(|source| InstallError::Remove {
                    path: path.clone(),
                    source,
                })?;
                info!(path = %path.display(), "removed");
            }
        }
        Ok(())
    }

    pub(super) fn service_loaded() -> Option<bool> {
        Command::new("launchctl")
            .args(["list", super::SERVICE_LABEL])
            .output()
            .ok()
            .map(|output| output.status.success())
    }
}

#[cfg(not(target_os = "macos"))]
mod imp {
    use super::{InstallError, Layout};

    pub(super) fn install(_layout: &Layout) -> Result<(), InstallError> {
        Err(InstallError::Unsupported)
    }

    pub(super) fn uninstall(_layout: &Layout) -> Result<(), InstallError> {
        Err(InstallError::Unsupported)
    }

    pub(super) fn service_loaded() -> Option<bool> {
        None
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Installs and loads the service under `prefix`.  Idempotent.
pub fn install(prefix: &Path) -> Result<(), InstallError> {
    let layout = Layout::new(prefix);
    imp::install(&layout)?;
    println!("Installed {} and loaded {SERVICE_LABEL}", layout.binary.display());
    println!("Logs: {}", layout.log_dir.display());
    Ok(())
}

/// Unloads the service and removes the files `install` created.
pub fn uninstall(prefix: &Path) -> Result<(), InstallError> {
    let layout = Layout::new(prefix);
    imp::uninstall(&layout)?;
    println!("Uninstalled {SERVICE_LABEL}");
    Ok(())
}

/// Prints installation, service, interface and daemon state.
pub fn status(prefix: &Path, config: &Config, status_path: &Path) -> anyhow::Result<()> {
    let layout = Layout::new(prefix);
    println!("awdl-guard {}", env!("CARGO_PKG_VERSION"));
    println!("  Installation: {}", layout.install_state());

    let service = match imp::service_loaded() {
        Some(true) => "loaded",
        Some(false) => "not loaded",
        None => "unavailable",
    };
    println!("  Service:      {service}");

    let interface = match InterfaceActuator::new(&config.interface).and_then(|a| a.is_up()) {
        Ok(true) => "up".to_string(),
        Ok(false) => "down".to_string(),
        Err(e) => format!("unknown ({e})"),
    };
    println!("  Interface:    {} is {interface}", config.interface);

    match process_monitor::running_pid(&config.target_process_name) {
        Some(pid) => println!("  Target app:   running (pid {pid})"),
        None => println!("  Target app:   not running"),
    }

    match status::read_status(status_path)? {
        Some(s) => {
            let pid = s.tracked_pid.map(|p| format!(" (pid {p})")).unwrap_or_default();
            println!("  Daemon:       {:?}{pid}", s.state);
            if let Some(at) = &s.last_transition {
                println!("  Since:        {at}");
            }
            if let Some(error) = &s.error {
                println!("  Last error:   {error}");
            }
        }
        None => println!("  Daemon:       no status recorded at {}", status_path.display()),
    }
    Ok(())
}
