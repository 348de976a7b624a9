/// Canonical file paths for awdl-guard data files.
///
/// Both files live in the data directory:
///   - config.toml  Written by the administrator, read by the daemon.
///   - status.toml  Written by the daemon, read by `awdl-guard status`.
use std::path::PathBuf;

/// Overrides the data directory when set.
pub const DATA_DIR_ENV: &str = "AWDL_GUARD_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

#[cfg(target_os = "macos")]
const DEFAULT_DATA_DIR: &str = "/Library/Application Support/awdl-guard";
#[cfg(not(target_os = "macos"))]
const DEFAULT_DATA_DIR: &str = "/var/lib/awdl-guard";

/// Returns the data directory: `$AWDL_GUARD_DIR` or the platform default.
pub fn app_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV))
}

fn data_dir_from(env_value: Option<std::ffi::OsString>) -> PathBuf {
    match env_value {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_DATA_DIR),
    }
}

/// Returns the full path to the config file.
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the full path to the status file.
pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}
