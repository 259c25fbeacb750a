//! Console Front End
//!
//! Line commands read from the terminal and the text rendering of bus events
//! and state snapshots.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use super::tunnel;
use crate::process::{ApplicationState, BusEvent, DecodedEvent, ProcessContext};
use crate::tunnel::TunnelSupervisor;

pub const HELP: &str = "\
Commands:
  state              show mode, token and sessions
  sessions           list connected sessions
  list               ask the host to report its sessions
  disconnect <id>    drop a connected session
  stop               stop the tunnel process
  help               show this help
  quit               stop the tunnel and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    State,
    Sessions,
    List,
    Disconnect(String),
    Stop,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = words.next().ok_or_else(|| "empty command".to_string())?;

        let parsed = match command.to_ascii_lowercase().as_str() {
            "state" | "status" => Self::State,
            "sessions" => Self::Sessions,
            "list" => Self::List,
            "disconnect" | "kick" => match words.next() {
                Some(id) => Self::Disconnect(id.to_string()),
                None => return Err("usage: disconnect <session id>".to_string()),
            },
            "stop" => Self::Stop,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command `{}` (try `help`)", other)),
        };

        if words.next().is_some() {
            return Err(format!("`{}` takes no further arguments", command));
        }
        Ok(parsed)
    }
}

/// Whether the console keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console {
    context: ProcessContext,
    supervisor: Arc<TunnelSupervisor>,
}

impl Console {
    pub fn new(context: ProcessContext, supervisor: Arc<TunnelSupervisor>) -> Self {
        Self { context, supervisor }
    }

    /// Parse and run one input line. Blank lines yield `None`.
    pub async fn execute_line(&self, line: &str) -> Option<(String, Flow)> {
        if line.trim().is_empty() {
            return None;
        }
        Some(match line.parse::<ConsoleCommand>() {
            Ok(command) => self.execute(command).await,
            Err(e) => (e, Flow::Continue),
        })
    }

    pub async fn execute(&self, command: ConsoleCommand) -> (String, Flow) {
        match command {
            ConsoleCommand::State => (self.with_state(render_state), Flow::Continue),
            ConsoleCommand::Sessions => (self.with_state(render_sessions), Flow::Continue),
            // The reply arrives later as a LIST action
            ConsoleCommand::List => (
                acknowledge(tunnel::server_list(&self.supervisor).await, "List requested"),
                Flow::Continue,
            ),
            ConsoleCommand::Disconnect(id) => {
                let done = format!("Disconnect requested for {}", id);
                (
                    acknowledge(tunnel::server_disconnect(&self.supervisor, id).await, &done),
                    Flow::Continue,
                )
            }
            ConsoleCommand::Stop => (
                acknowledge(tunnel::stop_process(&self.supervisor).await, "Stopping tunnel"),
                Flow::Continue,
            ),
            ConsoleCommand::Help => (HELP.to_string(), Flow::Continue),
            ConsoleCommand::Quit => {
                let text = if self.supervisor.is_running().await {
                    acknowledge(tunnel::stop_process(&self.supervisor).await, "Stopping tunnel")
                } else {
                    "Bye".to_string()
                };
                (text, Flow::Exit)
            }
        }
    }

    fn with_state(&self, render: impl FnOnce(&ApplicationState) -> String) -> String {
        match self.context.state() {
            Ok(state) => render(&state),
            Err(e) => e.to_string(),
        }
    }
}

fn acknowledge(result: Result<(), String>, done: &str) -> String {
    match result {
        Ok(()) => done.to_string(),
        Err(e) => format!("error: {}", e),
    }
}

/// One-line description of a bus event
pub fn describe(event: &BusEvent) -> String {
    match event {
        BusEvent::Started(info) => format!("[started] {} process {}", info.process_type, info.process_id),
        BusEvent::Terminated => "[terminated] tunnel process exited".to_string(),
        BusEvent::StdoutAction(action) => match action {
            DecodedEvent::Token { token } => format!("[token] {}", token),
            DecodedEvent::Connected { session_id, address, port } => {
                let mut line = format!("[connected] {}", session_id);
                if let Some(address) = address {
                    let _ = write!(line, " from {}", address);
                }
                if let Some(port) = port {
                    let _ = write!(line, " on port {}", port);
                }
                line
            }
            DecodedEvent::Disconnect { session_id } => format!("[disconnected] {}", session_id),
            DecodedEvent::List { sessions } if sessions.is_empty() => "[list] no sessions".to_string(),
            DecodedEvent::List { sessions } => format!("[list] {}", sessions.join(", ")),
            DecodedEvent::BackendStarted(info) => {
                format!("[backend] {} ready (process {})", info.process_type, info.process_id)
            }
            DecodedEvent::Error { message } => format!("[error] {}", message),
        },
    }
}

pub fn render_state(state: &ApplicationState) -> String {
    let mut out = format!("mode: {}", state.mode);
    if let Some(pid) = &state.process_id {
        let _ = write!(out, "\nprocess: {}", pid);
    }
    if let Some(token) = &state.token {
        let _ = write!(out, "\ntoken: {}", token);
    }
    let _ = write!(out, "\n{}", render_sessions(state));
    out
}

fn render_sessions(state: &ApplicationState) -> String {
    if state.sessions.is_empty() {
        return "sessions: none".to_string();
    }
    let mut out = format!("sessions ({}):", state.sessions.len());
    for session in &state.sessions {
        if session.address.is_empty() {
            let _ = write!(out, "\n  {}", session.session_id);
        } else {
            let _ = write!(out, "\n  {} ({})", session.session_id, session.address);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{inbound, InboundEvent, ProcessType, StartedInfo, StateManager};
    use serde_json::json;

    fn console() -> (Console, Arc<StateManager>) {
        let manager = Arc::new(StateManager::new());
        let (tx, _rx) = inbound::channel(8);
        let supervisor = Arc::new(TunnelSupervisor::new("tunnel", tx));
        (Console::new(ProcessContext::new(manager.clone()), supervisor), manager)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("state".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::State);
        assert_eq!("  LIST ".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::List);
        assert_eq!(
            "disconnect s-1".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Disconnect("s-1".to_string())
        );
        assert_eq!("exit".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!("disconnect".parse::<ConsoleCommand>().unwrap_err().starts_with("usage"));
        assert!("stop now".parse::<ConsoleCommand>().is_err());
        assert!("fly".parse::<ConsoleCommand>().unwrap_err().contains("unknown command"));
        assert!("".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_describe_events() {
        let connected = BusEvent::StdoutAction(DecodedEvent::Connected {
            session_id: "s1".to_string(),
            address: Some("10.0.0.2".to_string()),
            port: None,
        });
        assert_eq!(describe(&connected), "[connected] s1 from 10.0.0.2");

        let list = BusEvent::StdoutAction(DecodedEvent::List { sessions: vec![] });
        assert_eq!(describe(&list), "[list] no sessions");

        let started = BusEvent::Started(StartedInfo::new("42", ProcessType::Host));
        assert_eq!(describe(&started), "[started] host process 42");
        assert_eq!(describe(&BusEvent::Terminated), "[terminated] tunnel process exited");
    }

    #[test]
    fn test_render_state() {
        assert_eq!(render_state(&ApplicationState::default()), "mode: idle\nsessions: none");
    }

    #[tokio::test]
    async fn test_state_reflects_manager() {
        let (console, manager) = console();
        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "7", "processType": "host"
            })))
            .unwrap();
        manager
            .handle_event(InboundEvent::stdout(json!({"action": "CONNECTED", "sessionId": "s1", "address": "1.2.3.4"})))
            .unwrap();

        let (text, flow) = console.execute(ConsoleCommand::State).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(text, "mode: host\nprocess: 7\nsessions (1):\n  s1 (1.2.3.4)");
    }

    #[tokio::test]
    async fn test_commands_without_process() {
        let (console, _manager) = console();

        let (text, _) = console.execute(ConsoleCommand::Stop).await;
        assert_eq!(text, "error: Process not found");

        let (text, flow) = console.execute(ConsoleCommand::Quit).await;
        assert_eq!(text, "Bye");
        assert_eq!(flow, Flow::Exit);
    }

    #[tokio::test]
    async fn test_execute_line() {
        let (console, _manager) = console();
        assert!(console.execute_line("   ").await.is_none());

        let (text, flow) = console.execute_line("bogus").await.unwrap();
        assert!(text.contains("unknown command"));
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_detached_context_reports_unavailable() {
        let (tx, _rx) = inbound::channel(1);
        let console = Console::new(
            ProcessContext::detached(),
            Arc::new(TunnelSupervisor::new("tunnel", tx)),
        );
        let (text, _) = console.execute(ConsoleCommand::Sessions).await;
        assert!(text.contains("installed state manager"));
    }
}
