//! tunnel-hub binary.
//!
//! # Usage
//!
//! ```bash
//! # Expose local port 25565 over TCP
//! tunnel-hub host --port 25565
//!
//! # Join a host's tunnel, binding local port 25565
//! tunnel-hub client --token <token> --port 25565
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use tunnel_hub_lib::commands::console::{self, Console, Flow, HELP};
use tunnel_hub_lib::commands::tunnel as tunnel_commands;
use tunnel_hub_lib::config::AppConfig;
use tunnel_hub_lib::process::{self, handler, EventKind, ListenerGuard, ProcessContext, StateManager};
use tunnel_hub_lib::tunnel::{Network, TunnelSupervisor};

/// How long to wait for the last events to be rendered on exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Client/host tunnel sidecar console
#[derive(Parser, Debug)]
#[command(name = "tunnel-hub")]
#[command(about = "Run the tunnel sidecar and follow its sessions")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the tunnel binary
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Expose a local port through a new tunnel
    Host {
        #[arg(short, long)]
        port: u16,

        /// tcp or udp (defaults to tunnel.network from the config)
        #[arg(short, long)]
        network: Option<Network>,
    },
    /// Join an existing tunnel
    Client {
        #[arg(short, long)]
        token: String,

        /// Local port to bind (the sidecar picks one when omitted)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let filter = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let binary = config.resolve_binary(cli.binary.as_deref())?;
    info!("Using tunnel binary {}", binary.display());

    let manager = Arc::new(StateManager::new());
    let context = ProcessContext::new(manager.clone());
    let (tx, rx) = process::inbound::channel(config.tunnel.inbound_capacity);
    let supervisor = Arc::new(
        TunnelSupervisor::new(binary, tx)
            .with_extra_args(config.tunnel.args.clone())
            .with_shutdown_timeout(config.tunnel.shutdown_timeout()),
    );

    let exited = Arc::new(Notify::new());
    let renderers = install_renderers(&context, exited.clone())?;
    let pump = tokio::spawn(process::pump(manager, rx));

    let launched = match cli.role {
        Role::Host { port, network } => {
            let network = network.unwrap_or(config.tunnel.network);
            tunnel_commands::create_tunnel_server(&supervisor, port, network).await
        }
        Role::Client { token, port } => tunnel_commands::create_tunnel_client(&supervisor, token, port).await,
    };
    launched.map_err(anyhow::Error::msg).context("Failed to launch tunnel")?;

    println!("{}", HELP);
    let console = Console::new(context, supervisor.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some((reply, flow)) = console.execute_line(&line).await {
                        println!("{}", reply);
                        if flow == Flow::Exit {
                            break;
                        }
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = exited.notified() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if supervisor.is_running().await {
        if let Err(e) = supervisor.stop().await {
            warn!("Failed to stop tunnel: {}", e);
        }
    }

    // Dropping the last sender lets the pump finish once queued events are rendered
    drop(console);
    drop(supervisor);
    match tokio::time::timeout(DRAIN_TIMEOUT, pump).await {
        Ok(Ok(stats)) if stats.handler_failures > 0 => {
            warn!("{} handler failures during this run", stats.handler_failures)
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Event pump failed: {}", e),
        Err(_) => warn!("Timed out waiting for pending events"),
    }
    drop(renderers);

    Ok(())
}

/// Print every bus event, waking `exited` when the process terminates
fn install_renderers(context: &ProcessContext, exited: Arc<Notify>) -> Result<Vec<ListenerGuard>> {
    let mut guards = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let exited = exited.clone();
        let guard = context.listen_scoped(
            kind,
            handler(move |event| {
                println!("{}", console::describe(event));
                if kind == EventKind::Terminated {
                    exited.notify_one();
                }
                Ok(())
            }),
        )?;
        guards.push(guard);
    }
    Ok(guards)
}
