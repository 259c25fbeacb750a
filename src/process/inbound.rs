//! Inbound Events
//!
//! Envelope for raw events coming from the tunnel process boundary, and the
//! single-consumer pump that feeds them into the [`StateManager`] one at a
//! time.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::bus::EventKind;
use super::error::ProcessError;
use super::manager::StateManager;

/// Default capacity of the inbound channel
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// A raw event as emitted by the process boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn stdout(payload: Value) -> Self {
        Self::new(EventKind::StdoutAction, payload)
    }

    pub fn started(payload: Value) -> Self {
        Self::new(EventKind::Started, payload)
    }

    pub fn terminated() -> Self {
        Self::new(EventKind::Terminated, Value::Object(Default::default()))
    }
}

pub type InboundSender = mpsc::Sender<InboundEvent>;
pub type InboundReceiver = mpsc::Receiver<InboundEvent>;

/// Create the inbound channel
pub fn channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Counters collected by [`pump`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub processed: usize,
    pub dropped: usize,
    pub handler_failures: usize,
}

/// Drain `rx` into `manager` until every sender is gone.
///
/// Each event is decoded, applied and published before the next is received.
/// Malformed events and contract violations are logged and dropped.
pub async fn pump(manager: Arc<StateManager>, mut rx: InboundReceiver) -> PumpStats {
    let mut stats = PumpStats::default();

    while let Some(event) = rx.recv().await {
        let kind = event.kind;
        match manager.handle_event(event) {
            Ok(dispatch) => {
                stats.processed += 1;
                stats.handler_failures += dispatch.failures.len();
                debug!(
                    "Dispatched '{}' to {} handlers ({} failed)",
                    kind,
                    dispatch.invoked,
                    dispatch.failures.len()
                );
            }
            Err(e @ (ProcessError::MalformedEvent(_) | ProcessError::ProtocolContractViolation { .. })) => {
                stats.dropped += 1;
                warn!("Dropping '{}' event: {}", kind, e);
            }
            Err(e) => {
                stats.dropped += 1;
                error!("Failed to process '{}' event: {}", kind, e);
            }
        }
    }

    info!(
        "Inbound channel closed after {} events ({} dropped)",
        stats.processed, stats.dropped
    );
    stats
}
