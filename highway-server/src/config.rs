//! Server configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the YAML file named
//! by `HIGHWAY_CONFIG`, then `HIGHWAY_*` environment variables.

use highway_protocol::{DEFAULT_PORT, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "HIGHWAY_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Builds the effective configuration from every source and validates it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.network.apply_env();
        config.metrics.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file. Sections and keys left out keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_addr: SocketAddr,
    /// Seconds a connection may stay silent before it is closed.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
    /// Largest accepted frame (header plus body) in bytes.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_env(&mut self) {
        env_override("HIGHWAY_BIND", &mut self.bind_addr);
        env_override("HIGHWAY_IDLE_TIMEOUT", &mut self.idle_timeout_secs);
        env_override("HIGHWAY_MAX_CONNECTIONS", &mut self.max_connections);
        env_override("HIGHWAY_MAX_FRAME_SIZE", &mut self.max_frame_size);
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::Invalid(format!(
                "network.max_frame_size must be in 1..={}, got {}",
                MAX_FRAME_SIZE, self.max_frame_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env(&mut self) {
        if let Ok(flag) = std::env::var("HIGHWAY_METRICS_ENABLED") {
            self.enabled = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        env_override("HIGHWAY_METRICS_BIND", &mut self.bind_addr);
    }
}

/// Replaces `slot` with the parsed value of `var`, if set. Unparseable
/// values are logged and ignored.
fn env_override<T: FromStr>(var: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(var, value = %raw, "ignoring unparseable environment override"),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
