//! Tunnel Supervisor
//!
//! Owns at most one tunnel sidecar process. Its stdout JSON lines become
//! `stdout-action` inbound events; spawn and exit become `started` and
//! `terminated` events. Every stdout action of a run is queued before that
//! run's terminated event.

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::command::{LaunchSpec, StdinCommand};
use crate::process::{InboundEvent, InboundSender, ProcessType};

/// Default bound on how long a stop waits for the process to wind down
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the running sidecar
struct RunningTunnel {
    pid: u32,
    process_type: ProcessType,
    stdin: Option<ChildStdin>,
    /// Kill switch for the monitor task
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl RunningTunnel {
    fn has_exited(&self) -> bool {
        self.monitor.is_finished()
    }
}

/// Spawns, talks to and stops the tunnel sidecar
pub struct TunnelSupervisor {
    program: PathBuf,
    extra_args: Vec<String>,
    shutdown_timeout: Duration,
    events: InboundSender,
    current: Mutex<Option<RunningTunnel>>,
}

impl TunnelSupervisor {
    /// Create a supervisor for the sidecar at `program`, reporting into `events`
    pub fn new(program: impl Into<PathBuf>, events: InboundSender) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            events,
            current: Mutex::new(None),
        }
    }

    /// Arguments appended to every launch
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start the sidecar in the role described by `launch`, replacing any
    /// current process. Returns the new process id.
    pub async fn launch(&self, launch: &LaunchSpec) -> TunnelResult<u32> {
        launch.validate()?;
        let mut args = launch.args();
        args.extend(self.extra_args.iter().cloned());
        self.launch_with_args(launch.process_type(), args).await
    }

    pub(crate) async fn launch_with_args(&self, process_type: ProcessType, args: Vec<String>) -> TunnelResult<u32> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!("Replacing running tunnel process {}", previous.pid);
            self.shutdown(previous).await;
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed(format!("{}: {}", self.program.display(), e)))?;

        let pid = child
            .id()
            .ok_or_else(|| TunnelError::SpawnFailed("process exited before reporting a pid".to_string()))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::SpawnFailed("stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        // Queued before any stdout action of this run
        let started = json!({
            "action": "BACKEND_STARTED",
            "processId": pid.to_string(),
            "processType": process_type,
        });
        self.events
            .send(InboundEvent::started(started))
            .await
            .map_err(|_| TunnelError::ChannelClosed)?;

        let stdout_handle = tokio::spawn(read_stdout(stdout, self.events.clone()));
        let stderr_handle = stderr.map(|stderr| tokio::spawn(read_stderr(stderr)));
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            child,
            pid,
            kill_rx,
            stdout_handle,
            stderr_handle,
            self.events.clone(),
            self.shutdown_timeout,
        ));

        info!("Spawned tunnel {} process with ID: {}", process_type, pid);
        *current = Some(RunningTunnel {
            pid,
            process_type,
            stdin,
            kill_tx: Some(kill_tx),
            monitor,
        });

        Ok(pid)
    }

    /// Kill the current process
    pub async fn stop(&self) -> TunnelResult<()> {
        let mut current = self.current.lock().await;
        let tunnel = current.take().ok_or(TunnelError::NotRunning)?;
        if tunnel.has_exited() {
            debug!("Tunnel process {} already exited", tunnel.pid);
            return Err(TunnelError::NotRunning);
        }
        info!("Stopping tunnel process {}", tunnel.pid);
        self.shutdown(tunnel).await;
        Ok(())
    }

    /// Ask the host to drop a peer session
    pub async fn disconnect(&self, session_id: &str) -> TunnelResult<()> {
        self.send_command(&StdinCommand::disconnect(session_id)).await
    }

    /// Ask the host to enumerate its sessions
    pub async fn list(&self) -> TunnelResult<()> {
        self.send_command(&StdinCommand::list()).await
    }

    /// Write one command line to the sidecar's stdin
    pub async fn send_command(&self, command: &StdinCommand) -> TunnelResult<()> {
        let line = command.to_line()?;
        let mut current = self.current.lock().await;
        let tunnel = current
            .as_mut()
            .filter(|t| !t.has_exited())
            .ok_or(TunnelError::NotRunning)?;
        let stdin = tunnel.stdin.as_mut().ok_or(TunnelError::NotRunning)?;

        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        debug!("Sent {} to tunnel process {}", command.action, tunnel.pid);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map_or(false, |t| !t.has_exited())
    }

    /// Pid and role of the live process, if any
    pub async fn current(&self) -> Option<(u32, ProcessType)> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|t| !t.has_exited())
            .map(|t| (t.pid, t.process_type))
    }

    async fn shutdown(&self, mut tunnel: RunningTunnel) {
        drop(tunnel.stdin.take());
        if let Some(tx) = tunnel.kill_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(self.shutdown_timeout, &mut tunnel.monitor).await {
            Ok(Ok(())) => debug!("Tunnel process {} shut down", tunnel.pid),
            Ok(Err(e)) => error!("Monitor for tunnel process {} failed: {}", tunnel.pid, e),
            Err(_) => {
                warn!(
                    "Tunnel process {} did not shut down within {:?}; abandoning it",
                    tunnel.pid, self.shutdown_timeout
                );
                tunnel.monitor.abort();
                // The monitor never got to report the exit
                let _ = self.events.send(InboundEvent::terminated()).await;
            }
        }
    }
}

/// Wait for exit (or the kill switch), drain the readers, report termination
async fn monitor(
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    mut stdout_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
    events: InboundSender,
    drain_timeout: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tunnel process {}: {}", pid, e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => info!("Tunnel process {} terminated with exit code: {:?}", pid, status.code()),
        Err(e) => error!("Failed to wait for tunnel process {}: {}", pid, e),
    }

    // A grandchild may keep the pipe open after the sidecar itself is gone
    if tokio::time::timeout(drain_timeout, &mut stdout_handle).await.is_err() {
        warn!("Tunnel stdout for {} still open after exit; dropping the rest", pid);
        stdout_handle.abort();
    }
    if let Some(handle) = stderr_handle {
        handle.abort();
    }

    if events.send(InboundEvent::terminated()).await.is_err() {
        debug!("Inbound channel closed before termination of {} was reported", pid);
    }
}

/// Read one newline-terminated line, decoding invalid UTF-8 lossily.
/// Returns `None` at end of stream.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).trim().to_string()))
}

async fn read_stdout(stdout: ChildStdout, events: InboundSender) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match next_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(payload) => {
                        if events.send(InboundEvent::stdout(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!("Tunnel stdout: {}", line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read tunnel stdout: {}", e);
                break;
            }
        }
    }
}

/// Keeps draining until end of stream so the sidecar never writes to a closed pipe
async fn read_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        match next_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) if line.is_empty() => {}
            Ok(Some(line)) => warn!("Tunnel stderr: {}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read tunnel stderr: {}", e);
                break;
            }
        }
    }
}

/// Sidecar boundary errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Process not found")]
    NotRunning,

    #[error("Failed to spawn tunnel process: {0}")]
    SpawnFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Inbound event channel closed")]
    ChannelClosed,

    #[error("Failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write to stdin: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TunnelError> for String {
    fn from(err: TunnelError) -> String {
        err.to_string()
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
