//! Tunnel Commands
//!
//! Outbound commands issued to the tunnel sidecar: launch arguments for the
//! two roles and JSON lines written to its stdin.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::supervisor::TunnelError;
use crate::process::ProcessType;

/// Transport the host exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Network {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(TunnelError::InvalidArgument(format!("unknown network `{}`", other))),
        }
    }
}

/// A port the host can listen on
pub fn is_port_valid(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// How to launch the sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Expose a local port through a new tunnel
    Host { port: u16, network: Network },
    /// Join a host's tunnel with its token, optionally binding a local port
    Client { token: String, port: Option<u16> },
}

impl LaunchSpec {
    pub fn host(port: u16, network: Network) -> Self {
        Self::Host { port, network }
    }

    pub fn client(token: impl Into<String>, port: Option<u16>) -> Self {
        Self::Client {
            token: token.into(),
            port,
        }
    }

    pub fn process_type(&self) -> ProcessType {
        match self {
            Self::Host { .. } => ProcessType::Host,
            Self::Client { .. } => ProcessType::Client,
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        match self {
            Self::Host { port, .. } if !is_port_valid(u32::from(*port)) => Err(TunnelError::InvalidArgument(
                format!("host port must be between 1 and 65535, got {}", port),
            )),
            Self::Client { token, .. } if token.trim().is_empty() => Err(TunnelError::InvalidArgument(
                "client token must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Command line arguments understood by the sidecar
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Host { port, network } => vec![
                "--port".to_string(),
                port.to_string(),
                "--network".to_string(),
                network.to_string(),
            ],
            Self::Client { token, port } => vec![
                "--token".to_string(),
                token.clone(),
                "--port".to_string(),
                port.unwrap_or(0).to_string(),
            ],
        }
    }
}

/// Command written to the sidecar's stdin, one JSON object per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinCommand {
    pub action: String,
    pub session_id: String,
}

impl StdinCommand {
    pub fn disconnect(session_id: impl Into<String>) -> Self {
        Self {
            action: "DISCONNECT".to_string(),
            session_id: session_id.into(),
        }
    }

    pub fn list() -> Self {
        Self {
            action: "LIST".to_string(),
            session_id: String::new(),
        }
    }

    /// Serialized line including the trailing newline
    pub fn to_line(&self) -> Result<String, TunnelError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
