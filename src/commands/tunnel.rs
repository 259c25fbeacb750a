//! Tunnel Commands
//!
//! Front-end entry points for the outbound commands. Errors are flattened to
//! strings for display; results are acknowledged only by a process id or by
//! the events that follow.

use log::info;

use crate::tunnel::{LaunchSpec, Network, TunnelSupervisor};

/// Start a host-mode tunnel exposing `port`
pub async fn create_tunnel_server(
    supervisor: &TunnelSupervisor,
    port: u16,
    network: Network,
) -> Result<u32, String> {
    let pid = supervisor
        .launch(&LaunchSpec::host(port, network))
        .await
        .map_err(|e| e.to_string())?;
    info!("Hosting port {} over {} (process {})", port, network, pid);
    Ok(pid)
}

/// Join a host's tunnel with `token`
pub async fn create_tunnel_client(
    supervisor: &TunnelSupervisor,
    token: String,
    port: Option<u16>,
) -> Result<u32, String> {
    let pid = supervisor
        .launch(&LaunchSpec::client(token, port))
        .await
        .map_err(|e| e.to_string())?;
    info!("Joined tunnel as client (process {})", pid);
    Ok(pid)
}

/// Drop a connected peer
pub async fn server_disconnect(supervisor: &TunnelSupervisor, session: String) -> Result<(), String> {
    supervisor.disconnect(&session).await.map_err(String::from)
}

/// Ask the host for a LIST action
pub async fn server_list(supervisor: &TunnelSupervisor) -> Result<(), String> {
    supervisor.list().await.map_err(String::from)
}

pub async fn stop_process(supervisor: &TunnelSupervisor) -> Result<(), String> {
    supervisor.stop().await.map_err(String::from)
}
