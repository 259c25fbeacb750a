//! State Manager
//!
//! Composition root for the decoder, session registry, lifecycle and event
//! bus. It is the only writer of [`ApplicationState`]; consumers read
//! snapshots and subscribe to events.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::thread::{self, ThreadId};

use super::action::{decode, DecodedEvent, StartedInfo};
use super::bus::{BusEvent, Dispatch, EventBus, EventKind, Handler, Subscription};
use super::error::{ProcessError, ProcessResult};
use super::inbound::InboundEvent;
use super::lifecycle::{ProcessLifecycle, ProcessMode, Transition};
use super::registry::{Session, SessionRegistry};

/// Point-in-time view of the tunnel as seen by consumers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub mode: ProcessMode,
    pub sessions: Vec<Session>,
    pub token: Option<String>,
    pub process_id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    registry: SessionRegistry,
    lifecycle: ProcessLifecycle,
    token: Option<String>,
    /// Set once the running process has issued its own TOKEN
    token_from_run: bool,
}

impl Inner {
    fn snapshot(&self) -> ApplicationState {
        ApplicationState {
            mode: self.lifecycle.mode(),
            sessions: self.registry.snapshot(),
            token: self.token.clone(),
            process_id: self.lifecycle.process_id().map(str::to_string),
        }
    }

    fn discard_run_state(&mut self) {
        self.registry.clear();
        self.token = None;
        self.token_from_run = false;
    }

    fn apply_action(&mut self, action: &DecodedEvent) {
        match action {
            DecodedEvent::Token { token } => self.apply_token(token),
            DecodedEvent::Connected {
                session_id,
                address,
                ..
            } => {
                let address = address.as_deref().unwrap_or_default();
                if self.registry.upsert_on_connect(session_id, address) {
                    info!("Session connected: {} ({})", session_id, address);
                }
            }
            DecodedEvent::Disconnect { session_id } => {
                if self.registry.remove_on_disconnect(session_id) {
                    info!("Session disconnected: {}", session_id);
                } else {
                    debug!("Disconnect for unknown session {}", session_id);
                }
            }
            DecodedEvent::List { sessions } => {
                debug!("Backend lists {} sessions", sessions.len());
            }
            DecodedEvent::BackendStarted(started) => self.apply_started(started),
            DecodedEvent::Error { message } => {
                warn!("Backend reported error: {}", message);
            }
        }
    }

    /// The first TOKEN of a run replaces one received while idle; later ones are ignored
    fn apply_token(&mut self, token: &str) {
        let running = self.lifecycle.is_running();
        match &self.token {
            Some(current) if current == token => self.token_from_run |= running,
            Some(_) if self.token_from_run || !running => {
                warn!("Ignoring second TOKEN for the current run")
            }
            previous => {
                if previous.is_some() {
                    info!("Replacing token received before the process started");
                } else {
                    info!("Received connection token");
                }
                self.token = Some(token.to_string());
                self.token_from_run = running;
            }
        }
    }

    fn apply_started(&mut self, started: &StartedInfo) {
        let transition = self.lifecycle.start(started);
        if transition.discards_run_state() {
            self.discard_run_state();
        }

        match transition {
            Transition::Restarted { previous, mode } => info!(
                "Tunnel restarted as {} (was {}), process {}",
                mode, previous, started.process_id
            ),
            _ => info!(
                "Tunnel started as {}, process {}",
                started.process_type, started.process_id
            ),
        }
    }

    fn apply_terminated(&mut self) {
        let transition = self.lifecycle.terminate();
        self.discard_run_state();

        match transition {
            Transition::Terminated { previous } => info!("Tunnel ({}) terminated", previous),
            _ => debug!("Terminated signal while idle"),
        }
    }
}

/// Owner of all process-derived state
pub struct StateManager {
    inner: RwLock<Inner>,
    bus: EventBus,
    /// Serialises mutate-then-publish so events never interleave
    ingest: Mutex<()>,
    /// Thread currently publishing, for detecting calls from inside a handler
    dispatching: Mutex<Option<ThreadId>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus: EventBus::new(),
            ingest: Mutex::new(()),
            dispatching: Mutex::new(None),
        }
    }

    /// Current state snapshot
    pub fn get_state(&self) -> ApplicationState {
        self.inner.read().snapshot()
    }

    pub fn mode(&self) -> ProcessMode {
        self.inner.read().lifecycle.mode()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().registry.snapshot()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.read().token.clone()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> Subscription {
        self.bus.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        self.bus.unsubscribe(kind, handler)
    }

    pub fn cancel(&self, subscription: Subscription) -> bool {
        self.bus.cancel(subscription)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.bus.listener_count(kind)
    }

    /// Process one inbound event to completion: decode, mutate, publish.
    ///
    /// Malformed payloads and contract violations are returned as errors
    /// without touching state or reaching subscribers. Handlers must not call
    /// this method; they should queue follow-up events on the inbound channel.
    /// A call from inside a handler fails with [`ProcessError::InvariantViolation`].
    pub fn handle_event(&self, event: InboundEvent) -> ProcessResult<Dispatch> {
        let caller = thread::current().id();
        if *self.dispatching.lock() == Some(caller) {
            return Err(ProcessError::InvariantViolation(
                "re-entrant handle_event from an event handler".to_string(),
            ));
        }
        let _ingest = self.ingest.lock();
        debug!("Inbound '{}' event: {}", event.kind, event.payload);

        let published = match event.kind {
            EventKind::StdoutAction => {
                let action = decode(&event.payload)?;
                self.mutate(|inner| inner.apply_action(&action))?;
                BusEvent::StdoutAction(action)
            }
            EventKind::Started => {
                let started = Self::expect_started(&event)?;
                self.mutate(|inner| inner.apply_started(&started))?;
                BusEvent::Started(started)
            }
            EventKind::Terminated => {
                self.mutate(Inner::apply_terminated)?;
                BusEvent::Terminated
            }
        };

        let _dispatching = DispatchingGuard::enter(&self.dispatching, caller);
        Ok(self.bus.publish(&published))
    }

    fn expect_started(event: &InboundEvent) -> ProcessResult<StartedInfo> {
        let violation = |reason: String| ProcessError::ProtocolContractViolation {
            kind: EventKind::Started,
            reason,
        };

        match decode(&event.payload) {
            Ok(DecodedEvent::BackendStarted(started)) => Ok(started),
            Ok(other) => Err(violation(format!(
                "expected BACKEND_STARTED, got {}",
                other.action()
            ))),
            Err(e) => Err(violation(e.to_string())),
        }
    }

    /// Apply a mutation under the write lock. The lock is released before
    /// publishing so handlers can read state.
    fn mutate<F>(&self, apply: F) -> ProcessResult<()>
    where
        F: FnOnce(&mut Inner),
    {
        let mut inner = self.inner.write();
        apply(&mut *inner);
        inner.registry.check_invariants()
    }
}

/// Marks the publishing thread for the duration of a fan-out
struct DispatchingGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DispatchingGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
        *slot.lock() = Some(thread);
        Self { slot }
    }
}

impl Drop for DispatchingGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::bus::handler;
    use serde_json::json;
    use std::sync::Arc;

    fn stdout(manager: &StateManager, payload: serde_json::Value) -> ProcessResult<Dispatch> {
        manager.handle_event(InboundEvent::stdout(payload))
    }

    fn recorder(manager: &StateManager, kind: EventKind) -> Arc<Mutex<Vec<BusEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.subscribe(
            kind,
            handler(move |event| {
                sink.lock().push(event.clone());
                Ok(())
            }),
        );
        seen
    }

    #[test]
    fn test_initial_state() {
        let manager = StateManager::new();
        assert_eq!(manager.get_state(), ApplicationState::default());
        assert_eq!(manager.mode(), ProcessMode::Idle);
    }

    #[test]
    fn test_host_session_scenario() {
        let manager = StateManager::new();

        stdout(
            &manager,
            json!({"action": "BACKEND_STARTED", "processId": "p1", "processType": "host"}),
        )
        .unwrap();
        let state = manager.get_state();
        assert_eq!(state.mode, ProcessMode::Host);
        assert!(state.sessions.is_empty());
        assert_eq!(state.token, None);

        stdout(&manager, json!({"action": "CONNECTED", "sessionId": "s1", "address": "10.0.0.2"})).unwrap();
        assert_eq!(manager.sessions(), vec![Session::new("s1", "10.0.0.2")]);

        stdout(&manager, json!({"action": "DISCONNECT", "sessionId": "s1"})).unwrap();
        assert!(manager.sessions().is_empty());

        manager.handle_event(InboundEvent::terminated()).unwrap();
        assert_eq!(manager.get_state(), ApplicationState::default());
    }

    #[test]
    fn test_token_cleared_on_terminate() {
        let manager = StateManager::new();
        stdout(&manager, json!({"action": "TOKEN", "token": "abc123"})).unwrap();
        assert_eq!(manager.token().as_deref(), Some("abc123"));

        manager.handle_event(InboundEvent::terminated()).unwrap();
        assert_eq!(manager.token(), None);
    }

    #[test]
    fn test_token_set_once_per_run() {
        let manager = StateManager::new();
        stdout(&manager, json!({"action": "TOKEN", "token": "first"})).unwrap();
        stdout(&manager, json!({"action": "TOKEN", "token": "second"})).unwrap();
        assert_eq!(manager.token().as_deref(), Some("first"));
    }

    #[test]
    fn test_run_token_replaces_idle_token() {
        let manager = StateManager::new();
        stdout(&manager, json!({"action": "TOKEN", "token": "early"})).unwrap();
        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p1", "processType": "host"
            })))
            .unwrap();
        assert_eq!(manager.token().as_deref(), Some("early"));

        stdout(&manager, json!({"action": "TOKEN", "token": "issued"})).unwrap();
        assert_eq!(manager.token().as_deref(), Some("issued"));

        stdout(&manager, json!({"action": "TOKEN", "token": "again"})).unwrap();
        assert_eq!(manager.token().as_deref(), Some("issued"));
    }

    #[test]
    fn test_run_token_matching_idle_token_locks_it() {
        let manager = StateManager::new();
        stdout(&manager, json!({"action": "TOKEN", "token": "same"})).unwrap();
        stdout(
            &manager,
            json!({"action": "BACKEND_STARTED", "processId": "p1", "processType": "client"}),
        )
        .unwrap();
        stdout(&manager, json!({"action": "TOKEN", "token": "same"})).unwrap();
        stdout(&manager, json!({"action": "TOKEN", "token": "other"})).unwrap();
        assert_eq!(manager.token().as_deref(), Some("same"));
    }

    #[test]
    fn test_reentrant_handle_event_fails() {
        let manager = Arc::new(StateManager::new());
        let nested = Arc::new(Mutex::new(None));

        let inner_manager = Arc::downgrade(&manager);
        let sink = nested.clone();
        manager.subscribe(
            EventKind::StdoutAction,
            handler(move |_| {
                if let Some(manager) = inner_manager.upgrade() {
                    let result = manager.handle_event(InboundEvent::stdout(json!({"action": "LIST", "sessions": []})));
                    *sink.lock() = Some(result.map(|_| ()));
                }
                Ok(())
            }),
        );

        let dispatch = stdout(&manager, json!({"action": "TOKEN", "token": "t"})).unwrap();
        assert!(dispatch.is_clean());
        assert!(matches!(
            nested.lock().take(),
            Some(Err(ProcessError::InvariantViolation(_)))
        ));

        // The guard is released once the fan-out ends
        stdout(&manager, json!({"action": "LIST", "sessions": []})).unwrap();
    }

    #[test]
    fn test_malformed_payload_changes_nothing() {
        let manager = StateManager::new();
        let seen = recorder(&manager, EventKind::StdoutAction);
        stdout(&manager, json!({"action": "TOKEN", "token": "abc"})).unwrap();
        let before = manager.get_state();

        let result = stdout(&manager, json!({"action": "UNKNOWN_TAG"}));
        assert!(matches!(result, Err(ProcessError::MalformedEvent(_))));
        assert_eq!(manager.get_state(), before);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_terminated_always_resets() {
        let manager = StateManager::new();
        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p1", "processType": "client"
            })))
            .unwrap();
        stdout(&manager, json!({"action": "TOKEN", "token": "t"})).unwrap();
        stdout(&manager, json!({"action": "CONNECTED", "sessionId": "a"})).unwrap();
        stdout(&manager, json!({"action": "CONNECTED", "sessionId": "b"})).unwrap();

        let seen = recorder(&manager, EventKind::Terminated);
        manager.handle_event(InboundEvent::terminated()).unwrap();
        manager.handle_event(InboundEvent::terminated()).unwrap();

        assert_eq!(manager.get_state(), ApplicationState::default());
        assert_eq!(*seen.lock(), vec![BusEvent::Terminated, BusEvent::Terminated]);
    }

    #[test]
    fn test_host_counts_distinct_sessions() {
        let manager = StateManager::new();
        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p1", "processType": "host"
            })))
            .unwrap();

        for id in ["s1", "s2", "s1", "s3", "s2", "s1"] {
            stdout(&manager, json!({"action": "CONNECTED", "sessionId": id})).unwrap();
        }

        let state = manager.get_state();
        assert_eq!(state.mode, ProcessMode::Host);
        assert_eq!(state.sessions.len(), 3);
        assert_eq!(state.sessions[0].address, "");
    }

    #[test]
    fn test_started_requires_backend_started() {
        let manager = StateManager::new();
        let seen = recorder(&manager, EventKind::Started);

        let result = manager.handle_event(InboundEvent::started(json!({"action": "TOKEN", "token": "t"})));
        assert!(matches!(
            result,
            Err(ProcessError::ProtocolContractViolation { kind: EventKind::Started, .. })
        ));

        let result = manager.handle_event(InboundEvent::started(serde_json::Value::Null));
        assert!(matches!(result, Err(ProcessError::ProtocolContractViolation { .. })));

        assert_eq!(manager.mode(), ProcessMode::Idle);
        assert_eq!(manager.token(), None);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_started_event_published() {
        let manager = StateManager::new();
        let seen = recorder(&manager, EventKind::Started);

        let dispatch = manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED",
                "started_info": {"process_id": "77", "process_type": "client"}
            })))
            .unwrap();

        assert_eq!(dispatch.invoked, 1);
        assert_eq!(manager.mode(), ProcessMode::Client);
        assert_eq!(manager.get_state().process_id.as_deref(), Some("77"));
        assert_eq!(
            *seen.lock(),
            vec![BusEvent::Started(StartedInfo::new("77", crate::process::ProcessType::Client))]
        );
    }

    #[test]
    fn test_restart_discards_stale_run_state() {
        let manager = StateManager::new();
        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p1", "processType": "client"
            })))
            .unwrap();
        stdout(&manager, json!({"action": "TOKEN", "token": "old"})).unwrap();
        stdout(&manager, json!({"action": "CONNECTED", "sessionId": "s1"})).unwrap();

        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p2", "processType": "host"
            })))
            .unwrap();

        let state = manager.get_state();
        assert_eq!(state.mode, ProcessMode::Host);
        assert!(state.sessions.is_empty());
        assert_eq!(state.token, None);
        assert_eq!(state.process_id.as_deref(), Some("p2"));
    }

    #[test]
    fn test_handlers_observe_post_mutation_state() {
        let manager = Arc::new(StateManager::new());
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let manager_inner = manager.clone();
            let observed = observed.clone();
            manager.subscribe(
                EventKind::Terminated,
                handler(move |_| {
                    observed.lock().push(manager_inner.get_state());
                    Ok(())
                }),
            );
        }

        manager
            .handle_event(InboundEvent::started(json!({
                "action": "BACKEND_STARTED", "processId": "p1", "processType": "host"
            })))
            .unwrap();
        stdout(&manager, json!({"action": "CONNECTED", "sessionId": "s1"})).unwrap();
        manager.handle_event(InboundEvent::terminated()).unwrap();

        assert_eq!(*observed.lock(), vec![ApplicationState::default()]);
    }

    #[test]
    fn test_backend_error_is_published_without_state_change() {
        let manager = StateManager::new();
        let seen = recorder(&manager, EventKind::StdoutAction);

        stdout(&manager, json!({"action": "ERROR", "message": "connection refused"})).unwrap();

        assert_eq!(manager.get_state(), ApplicationState::default());
        assert_eq!(
            seen.lock()[0].action(),
            Some(&DecodedEvent::Error { message: "connection refused".to_string() })
        );
    }

    #[test]
    fn test_failing_handler_does_not_block_state_or_siblings() {
        let manager = StateManager::new();
        manager.subscribe(EventKind::StdoutAction, handler(|_| anyhow::bail!("boom")));
        let seen = recorder(&manager, EventKind::StdoutAction);

        let dispatch = stdout(&manager, json!({"action": "CONNECTED", "sessionId": "s1"})).unwrap();

        assert_eq!(dispatch.failures.len(), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(manager.sessions().len(), 1);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = ApplicationState {
            mode: ProcessMode::Host,
            sessions: vec![Session::new("s1", "10.0.0.2")],
            token: None,
            process_id: Some("p1".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "mode": "Host",
                "sessions": [{"sessionId": "s1", "address": "10.0.0.2"}],
                "token": null,
                "processId": "p1"
            })
        );
    }
}
