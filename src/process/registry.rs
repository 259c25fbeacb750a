//! Session Registry
//!
//! Ordered, unique-keyed collection of the peers currently connected to the
//! tunnel. Insertion order is the only ordering.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::{ProcessError, ProcessResult};

/// One connected remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Network origin of the peer, empty when unknown
    pub address: String,
}

impl Session {
    pub fn new(session_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            address: address.into(),
        }
    }
}

/// Active sessions in connect order
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session unless its id is already present.
    /// Returns whether the registry changed.
    pub fn upsert_on_connect(&mut self, session_id: &str, address: &str) -> bool {
        if self.contains(session_id) {
            debug!("Ignoring duplicate connect for session {}", session_id);
            return false;
        }

        self.sessions.push(Session::new(session_id, address));
        true
    }

    /// Remove the session with this id, if present.
    /// Returns whether the registry changed.
    pub fn remove_on_disconnect(&mut self, session_id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.session_id != session_id);
        before != self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Copy of the current sessions, in connect order
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.clone()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.iter().any(|s| s.session_id == session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Verify that no session id appears twice
    pub fn check_invariants(&self) -> ProcessResult<()> {
        let mut seen = HashSet::with_capacity(self.sessions.len());
        for session in &self.sessions {
            if !seen.insert(session.session_id.as_str()) {
                return Err(ProcessError::InvariantViolation(format!(
                    "duplicate session id in registry: {}",
                    session.session_id
                )));
            }
        }
        Ok(())
    }
}
