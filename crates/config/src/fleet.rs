//! Fleet-wide settings from `fleet.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const FLEET_CONFIG_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// Directory with per-host declarations, relative to the config file
    #[serde(default = "default_host_vars")]
    pub host_vars: PathBuf,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_host_vars() -> PathBuf {
    PathBuf::from("host_vars")
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            host_vars: default_host_vars(),
            runtime: RuntimeConfig::default(),
            executor: ExecutorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(FLEET_CONFIG_FILE))
    }

    /// Like [`FleetConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `host_vars` resolved against the directory holding the config file.
    pub fn host_vars_dir(&self, base: &Path) -> PathBuf {
        if self.host_vars.is_absolute() {
            self.host_vars.clone()
        } else {
            base.join(&self.host_vars)
        }
    }
}

/// How to reach the container runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Runtime CLI binary
    #[serde(default = "default_runtime_binary")]
    pub binary: PathBuf,
    /// Seconds before a single runtime command counts as timed out
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_runtime_binary() -> PathBuf {
    PathBuf::from("podman")
}

fn default_command_timeout() -> u64 {
    120
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// Worker pool and retry behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Concurrent operations per host
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts after the first one for transient errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based): base, 2*base, 4*base ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Defaults for container health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Seconds before a probe gives up
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    /// Seconds between probe attempts
    #[serde(default = "default_health_interval")]
    pub interval: u64,
}

fn default_health_timeout() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout: default_health_timeout(),
            interval: default_health_interval(),
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}
