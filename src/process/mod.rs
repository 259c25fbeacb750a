//! Process Event Bus & Session State
//!
//! Interprets the tunnel process's stdout action stream and derives the
//! application state consumers observe:
//! - Action decoding with strict narrowing of the six known actions
//! - Ordered, unique session registry
//! - Idle / client / host lifecycle with restart handling
//! - Snapshot-on-publish event bus with per-handler failure isolation

pub mod action;
pub mod bus;
pub mod context;
pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod manager;
pub mod registry;

pub use action::{decode, decode_line, DecodedEvent, ProcessType, StartedInfo};
pub use bus::{handler, BusEvent, Dispatch, EventBus, EventKind, Handler, HandlerFailure, HandlerResult, Subscription};
pub use context::{ListenerGuard, ProcessContext};
pub use error::{ProcessError, ProcessResult};
pub use inbound::{pump, InboundEvent, InboundReceiver, InboundSender, PumpStats};
pub use lifecycle::{ProcessLifecycle, ProcessMode, Transition};
pub use manager::{ApplicationState, StateManager};
pub use registry::{Session, SessionRegistry};
