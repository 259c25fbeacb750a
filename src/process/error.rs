//! Process Error Types
//!
//! Error taxonomy for the event bus and state manager.

use thiserror::Error;

use super::bus::{EventKind, HandlerFailure};

/// Errors raised while interpreting or dispatching process events
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Payload does not match any known action shape
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Payload shape is incompatible with the event kind it arrived on
    #[error("Protocol contract violation on '{kind}': {reason}")]
    ProtocolContractViolation { kind: EventKind, reason: String },

    /// A subscriber failed while handling an event
    #[error("{0}")]
    HandlerFailure(HandlerFailure),

    /// Accessor used without an installed state manager
    #[error("{0} must be used with an installed state manager")]
    ContextUnavailable(&'static str),

    #[error("Invalid process type: {0}")]
    InvalidProcessType(String),

    /// Internal invariant broken; this is a bug, not an input problem
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::MalformedEvent(err.to_string())
    }
}

impl From<ProcessError> for String {
    fn from(err: ProcessError) -> String {
        err.to_string()
    }
}

/// Result type alias for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;
