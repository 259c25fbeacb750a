//! Process Lifecycle
//!
//! Tracks whether the tunnel process is idle or running, and in which role.
//! `Idle -> Running(mode) -> Idle`; a start while running is a restart.

use serde::{Deserialize, Serialize};

use super::action::{ProcessType, StartedInfo};

/// Operating mode observed by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessMode {
    #[default]
    Idle,
    Client,
    Host,
}

impl From<ProcessType> for ProcessMode {
    fn from(process_type: ProcessType) -> Self {
        match process_type {
            ProcessType::Client => Self::Client,
            ProcessType::Host => Self::Host,
        }
    }
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Client => write!(f, "client"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Internal lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Running {
        process_type: ProcessType,
        process_id: String,
    },
}

/// Outcome of a lifecycle input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Running
    Started { mode: ProcessMode },
    /// Running -> Running; state from the previous run must be discarded
    Restarted { previous: ProcessMode, mode: ProcessMode },
    /// Running -> Idle
    Terminated { previous: ProcessMode },
    /// Terminate received while already idle
    AlreadyIdle,
}

impl Transition {
    /// Whether run-scoped state (sessions, token) must be dropped
    pub fn discards_run_state(&self) -> bool {
        !matches!(self, Self::Started { .. })
    }
}

#[derive(Debug, Default)]
pub struct ProcessLifecycle {
    state: LifecycleState,
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn mode(&self) -> ProcessMode {
        match &self.state {
            LifecycleState::Idle => ProcessMode::Idle,
            LifecycleState::Running { process_type, .. } => (*process_type).into(),
        }
    }

    pub fn process_id(&self) -> Option<&str> {
        match &self.state {
            LifecycleState::Idle => None,
            LifecycleState::Running { process_id, .. } => Some(process_id.as_str()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, LifecycleState::Running { .. })
    }

    /// Apply a BACKEND_STARTED input
    pub fn start(&mut self, info: &StartedInfo) -> Transition {
        let previous = self.mode();
        let mode = ProcessMode::from(info.process_type);

        self.state = LifecycleState::Running {
            process_type: info.process_type,
            process_id: info.process_id.clone(),
        };

        if previous == ProcessMode::Idle {
            Transition::Started { mode }
        } else {
            Transition::Restarted { previous, mode }
        }
    }

    /// Apply a terminated signal
    pub fn terminate(&mut self) -> Transition {
        let previous = self.mode();
        self.state = LifecycleState::Idle;

        if previous == ProcessMode::Idle {
            Transition::AlreadyIdle
        } else {
            Transition::Terminated { previous }
        }
    }
}
