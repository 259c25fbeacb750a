//! Action Decoder
//!
//! Narrows raw stdout payloads from the tunnel process into one of the six
//! known action variants. Decoding is pure: it never touches manager state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use super::error::{ProcessError, ProcessResult};

/// Action tags understood by the decoder
pub const KNOWN_ACTIONS: [&str; 6] = [
    "TOKEN",
    "CONNECTED",
    "DISCONNECT",
    "LIST",
    "BACKEND_STARTED",
    "ERROR",
];

/// Role the tunnel process was started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Client,
    Host,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Host => "host",
        }
    }
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "host" => Ok(Self::Host),
            other => Err(ProcessError::InvalidProcessType(other.to_string())),
        }
    }
}

/// Payload of a BACKEND_STARTED action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StartedWire")]
pub struct StartedInfo {
    #[serde(rename = "processId")]
    pub process_id: String,
    #[serde(rename = "processType")]
    pub process_type: ProcessType,
}

impl StartedInfo {
    pub fn new(process_id: impl Into<String>, process_type: ProcessType) -> Self {
        Self {
            process_id: process_id.into(),
            process_type,
        }
    }
}

/// Accepts both the flat shape and the backend's nested `started_info` object
#[derive(Deserialize)]
struct StartedWire {
    #[serde(default, rename = "processId", alias = "process_id")]
    process_id: Option<String>,
    #[serde(default, rename = "processType", alias = "process_type")]
    process_type: Option<ProcessType>,
    #[serde(default)]
    started_info: Option<NestedStarted>,
}

#[derive(Deserialize)]
struct NestedStarted {
    process_id: String,
    process_type: ProcessType,
}

impl TryFrom<StartedWire> for StartedInfo {
    type Error = String;

    fn try_from(wire: StartedWire) -> Result<Self, Self::Error> {
        match (wire.process_id, wire.process_type, wire.started_info) {
            (Some(process_id), Some(process_type), _) => Ok(Self {
                process_id,
                process_type,
            }),
            (None, None, Some(nested)) => Ok(Self {
                process_id: nested.process_id,
                process_type: nested.process_type,
            }),
            (None, _, None) => Err("missing field `processId`".to_string()),
            _ => Err("missing field `processType`".to_string()),
        }
    }
}

/// A validated action emitted by the tunnel process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecodedEvent {
    /// Backend issued a connection token
    Token { token: String },

    /// A peer session became active
    Connected {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
        #[serde(default, alias = "addr", skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// A peer session ended
    Disconnect {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
    },

    /// Informational enumeration of live session ids
    List { sessions: Vec<String> },

    /// Process has fully initialised
    BackendStarted(StartedInfo),

    /// Recoverable error reported by the backend
    Error {
        #[serde(alias = "error")]
        message: String,
    },
}

impl DecodedEvent {
    /// The wire tag of this action
    pub fn action(&self) -> &'static str {
        match self {
            Self::Token { .. } => "TOKEN",
            Self::Connected { .. } => "CONNECTED",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::List { .. } => "LIST",
            Self::BackendStarted(_) => "BACKEND_STARTED",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Session id this action refers to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Connected { session_id, .. } | Self::Disconnect { session_id } => {
                Some(session_id.as_str())
            }
            _ => None,
        }
    }
}

/// Decode a raw JSON payload into a [`DecodedEvent`]
pub fn decode(raw: &Value) -> ProcessResult<DecodedEvent> {
    let object = raw
        .as_object()
        .ok_or_else(|| ProcessError::MalformedEvent(format!("payload is not an object: {}", raw)))?;

    let action = match object.get("action") {
        Some(Value::String(action)) => action.as_str(),
        Some(other) => {
            return Err(ProcessError::MalformedEvent(format!(
                "`action` must be a string, got {}",
                other
            )))
        }
        None => return Err(ProcessError::MalformedEvent("missing field `action`".to_string())),
    };

    if !KNOWN_ACTIONS.contains(&action) {
        return Err(ProcessError::MalformedEvent(format!("unknown action `{}`", action)));
    }

    DecodedEvent::deserialize(raw)
        .map_err(|e| ProcessError::MalformedEvent(format!("{} action: {}", action, e)))
}

/// Decode one stdout line
pub fn decode_line(line: &str) -> ProcessResult<DecodedEvent> {
    let raw: Value = serde_json::from_str(line.trim())?;
    decode(&raw)
}
