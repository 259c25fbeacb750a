//! Tunnel Sidecar Boundary
//!
//! Launching and controlling the external tunnel process. Everything the
//! process reports flows back as inbound events for the state manager.

pub mod command;
pub mod supervisor;

pub use command::{is_port_valid, LaunchSpec, Network, StdinCommand};
pub use supervisor::{TunnelError, TunnelResult, TunnelSupervisor};
