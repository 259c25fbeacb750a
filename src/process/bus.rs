//! Event Bus
//!
//! Per-kind listener registries with snapshot-on-publish fan-out.
//! Handlers run synchronously on the publishing thread, in registration
//! order. A handler that fails or panics is reported and skipped; the rest of
//! the fan-out still runs.

use log::{debug, error};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::action::{DecodedEvent, StartedInfo};
use super::error::ProcessError;

/// Kinds of events a consumer can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StdoutAction,
    Terminated,
    Started,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::StdoutAction, Self::Terminated, Self::Started];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StdoutAction => "stdout-action",
            Self::Terminated => "terminated",
            Self::Started => "started",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProcessError;

    /// Accepts both the short names and the `tunnel-*` channel names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout-action" | "tunnel-stdout" => Ok(Self::StdoutAction),
            "terminated" | "tunnel-terminated" => Ok(Self::Terminated),
            "started" | "tunnel-started" => Ok(Self::Started),
            other => Err(ProcessError::MalformedEvent(format!("unknown event kind `{}`", other))),
        }
    }
}

/// A decoded event as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    StdoutAction(DecodedEvent),
    Started(StartedInfo),
    Terminated,
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StdoutAction(_) => EventKind::StdoutAction,
            Self::Started(_) => EventKind::Started,
            Self::Terminated => EventKind::Terminated,
        }
    }

    /// The decoded action, for stdout events
    pub fn action(&self) -> Option<&DecodedEvent> {
        match self {
            Self::StdoutAction(action) => Some(action),
            _ => None,
        }
    }
}

pub type HandlerResult = anyhow::Result<()>;

/// Subscriber callback. Identity (for [`EventBus::unsubscribe`]) is the `Arc` allocation.
pub type Handler = Arc<dyn Fn(&BusEvent) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&BusEvent) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability returned by [`EventBus::subscribe`]; pass it to [`EventBus::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub kind: EventKind,
    pub id: SubscriptionId,
}

/// A handler that returned an error or panicked during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub kind: EventKind,
    pub subscription: SubscriptionId,
    pub message: String,
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handler {} failed on '{}': {}",
            self.subscription, self.kind, self.message
        )
    }
}

/// Report of one publish cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub kind: EventKind,
    /// Handlers in the dispatch snapshot
    pub invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl Dispatch {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.invoked - self.failures.len()
    }
}

#[derive(Clone)]
struct Registration {
    id: SubscriptionId,
    handler: Handler,
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

/// Listener registry and dispatcher
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for every future event of `kind`.
    /// Registering the same handler twice yields two independent registrations.
    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Registration { id, handler });

        debug!("Subscribed {} to '{}'", id, kind);
        Subscription { kind, id }
    }

    /// Remove the most recent registration of `handler` for `kind`.
    /// Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            listeners.get_mut(&kind).and_then(|registrations| {
                registrations
                    .iter()
                    .rposition(|r| same_handler(&r.handler, handler))
                    .map(|index| registrations.remove(index))
            })
        };

        // Dropped outside the lock: a handler's captures may touch the bus
        match removed {
            Some(registration) => {
                debug!("Unsubscribed {} from '{}'", registration.id, kind);
                true
            }
            None => false,
        }
    }

    /// Remove the registration identified by `subscription`
    pub fn cancel(&self, subscription: Subscription) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            listeners.get_mut(&subscription.kind).and_then(|registrations| {
                registrations
                    .iter()
                    .position(|r| r.id == subscription.id)
                    .map(|index| registrations.remove(index))
            })
        };

        match removed {
            Some(_) => {
                debug!("Cancelled {} on '{}'", subscription.id, subscription.kind);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's kind at the moment of
    /// the call. Registration changes made by handlers apply to later publishes.
    pub fn publish(&self, event: &BusEvent) -> Dispatch {
        let kind = event.kind();
        let snapshot: Vec<Registration> = self
            .listeners
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for registration in &snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(event)));

            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => panic_message(&*payload),
            };

            let failure = HandlerFailure {
                kind,
                subscription: registration.id,
                message,
            };
            error!("{}", failure);
            failures.push(failure);
        }

        Dispatch {
            kind,
            invoked: snapshot.len(),
            failures,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
