// Tunnel Hub: process event bus and session state for the tunnel sidecar

// Declare modules
pub mod commands;
pub mod config;
pub mod process;
pub mod tunnel;
