use std::path::PathBuf;

/// Environment variable overriding the event-log storage root.
pub const LOG_DIR_ENV: &str = "TASKMUX_LOG_DIR";

/// Returns the config directory for taskmux.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("taskmux")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("taskmux")
    } else {
        PathBuf::from("/tmp/taskmux")
    }
}

/// Returns the root directory for session event logs and artifacts.
///
/// `TASKMUX_LOG_DIR` wins, then `$XDG_DATA_HOME/taskmux/logs`, then
/// `~/.taskmux/logs`.
pub fn default_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(data_dir) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_dir).join("taskmux").join("logs")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".taskmux").join("logs")
    } else {
        PathBuf::from("/tmp/taskmux/logs")
    }
}

/// Returns the file where live child pids are persisted between runs.
pub fn pid_file_path() -> PathBuf {
    dirs_path().join("processes.pid")
}

/// Returns the config file path for the taskmux server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
