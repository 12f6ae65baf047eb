use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libtaskmux::{EventLogConfig, ExecutorConfig};
use taskmux_protocol::paths;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub log_dir: PathBuf,
    pub pid_file: PathBuf,
    pub ping_interval_secs: u64,
    pub grace_period_secs: u64,
    /// `0` disables the limit.
    pub task_timeout_secs: u64,
    /// `0` disables the limit.
    pub idle_timeout_secs: u64,
    pub ring_buffer_bytes: usize,
    pub artifact_threshold_bytes: usize,
    pub artifact_max_bytes: usize,
    pub fsync: bool,
    pub default_rows: u16,
    pub default_cols: u16,
    pub allow_origins: Vec<String>,
}

impl ServerConfig {
    /// Read `path`, or the default config file if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = paths::config_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("invalid config file {}", config_path.display()))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.default_rows == 0 || self.default_cols == 0 {
            anyhow::bail!("default_rows and default_cols must be > 0");
        }
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping_interval_secs must be > 0");
        }
        if self.artifact_threshold_bytes > self.artifact_max_bytes {
            anyhow::bail!("artifact_threshold_bytes must not exceed artifact_max_bytes");
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn event_log(&self) -> EventLogConfig {
        EventLogConfig {
            artifact_threshold: self.artifact_threshold_bytes,
            artifact_max: self.artifact_max_bytes,
            fsync: self.fsync,
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            task_timeout: optional_secs(self.task_timeout_secs),
            idle_timeout: optional_secs(self.idle_timeout_secs),
            default_rows: self.default_rows,
            default_cols: self.default_cols,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            log_dir: paths::default_log_dir(),
            pid_file: paths::pid_file_path(),
            ping_interval_secs: taskmux_protocol::DEFAULT_PING_INTERVAL_SECS,
            grace_period_secs: 5,
            task_timeout_secs: 3600,
            idle_timeout_secs: 900,
            ring_buffer_bytes: 64 * 1024,
            artifact_threshold_bytes: 10 * 1024,
            artifact_max_bytes: 10 * 1024 * 1024,
            fsync: true,
            default_rows: 24,
            default_cols: 80,
            allow_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
