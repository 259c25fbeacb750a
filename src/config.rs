//! Configuration
//!
//! TOML settings for the sidecar and logging. Loaded from
//! `<config dir>/tunnel-hub/config.toml` unless a path is given.

use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::inbound::DEFAULT_INBOUND_CAPACITY;
use crate::tunnel::Network;

/// Environment variable that can point at the sidecar binary
pub const BINARY_ENV: &str = "TUNNEL_HUB_BINARY";

/// Name looked up on `PATH` when nothing else names the sidecar
pub const DEFAULT_BINARY_NAME: &str = "tunnel";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub log_level: Option<String>,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub binary: Option<PathBuf>,
    /// Network used by `host` when none is given on the command line
    pub network: Network,
    pub shutdown_timeout_ms: u64,
    /// Extra arguments appended to every launch
    pub args: Vec<String>,
    pub inbound_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: None,
            network: Network::Tcp,
            shutdown_timeout_ms: 5000,
            args: Vec::new(),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl TunnelConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl AppConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tunnel-hub").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_file(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => {
                    debug!("No config file found; using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::parse(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the sidecar binary: explicit override, config, environment, then `PATH`
    pub fn resolve_binary(&self, cli_override: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = cli_override {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = &self.tunnel.binary {
            return Ok(path.clone());
        }
        if let Some(path) = std::env::var_os(BINARY_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        which::which(DEFAULT_BINARY_NAME).map_err(|_| ConfigError::BinaryNotFound(DEFAULT_BINARY_NAME.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Tunnel binary `{0}` not found; set tunnel.binary, TUNNEL_HUB_BINARY or pass --binary")]
    BinaryNotFound(String),
}
