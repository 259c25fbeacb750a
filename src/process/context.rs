//! Process Context
//!
//! Explicit handle to the [`StateManager`], constructed once at startup and
//! passed to whichever layer needs it. Accessors on a context without a
//! manager return [`ProcessError::ContextUnavailable`] so the caller decides
//! whether to fail or fall back.

use std::sync::Arc;

use super::bus::{EventKind, Handler, Subscription};
use super::error::{ProcessError, ProcessResult};
use super::lifecycle::ProcessMode;
use super::manager::{ApplicationState, StateManager};
use super::registry::Session;

#[derive(Clone, Default)]
pub struct ProcessContext {
    manager: Option<Arc<StateManager>>,
}

impl ProcessContext {
    pub fn new(manager: Arc<StateManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    /// A context with no manager installed
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.manager.is_some()
    }

    fn require(&self, caller: &'static str) -> ProcessResult<&Arc<StateManager>> {
        self.manager
            .as_ref()
            .ok_or(ProcessError::ContextUnavailable(caller))
    }

    pub fn manager(&self) -> ProcessResult<&Arc<StateManager>> {
        self.require("manager")
    }

    pub fn state(&self) -> ProcessResult<ApplicationState> {
        Ok(self.require("state")?.get_state())
    }

    pub fn token(&self) -> ProcessResult<Option<String>> {
        Ok(self.require("token")?.token())
    }

    pub fn sessions(&self) -> ProcessResult<Vec<Session>> {
        Ok(self.require("sessions")?.sessions())
    }

    pub fn mode(&self) -> ProcessResult<ProcessMode> {
        Ok(self.require("mode")?.mode())
    }

    /// Register a listener that stays until explicitly cancelled
    pub fn listen(&self, kind: EventKind, handler: Handler) -> ProcessResult<Subscription> {
        Ok(self.require("listen")?.subscribe(kind, handler))
    }

    /// Register a listener tied to the returned guard's lifetime
    pub fn listen_scoped(&self, kind: EventKind, handler: Handler) -> ProcessResult<ListenerGuard> {
        let manager = self.require("listen_scoped")?;
        let subscription = manager.subscribe(kind, handler);
        Ok(ListenerGuard {
            manager: manager.clone(),
            subscription: Some(subscription),
        })
    }
}

/// Cancels its subscription when dropped
pub struct ListenerGuard {
    manager: Arc<StateManager>,
    subscription: Option<Subscription>,
}

impl ListenerGuard {
    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription
    }

    /// Cancel now; returns whether the registration was still present
    pub fn cancel(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        match self.subscription.take() {
            Some(subscription) => self.manager.cancel(subscription),
            None => false,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::bus::handler;
    use crate::process::inbound::InboundEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_detached_context_reports_unavailable() {
        let context = ProcessContext::detached();
        assert!(!context.is_available());
        assert!(matches!(context.token(), Err(ProcessError::ContextUnavailable("token"))));
        assert!(matches!(context.sessions(), Err(ProcessError::ContextUnavailable(_))));
        assert!(matches!(
            context.listen(EventKind::Started, handler(|_| Ok(()))),
            Err(ProcessError::ContextUnavailable("listen"))
        ));
    }

    #[test]
    fn test_context_reads_manager_state() {
        let manager = Arc::new(StateManager::new());
        let context = ProcessContext::new(manager.clone());

        manager
            .handle_event(InboundEvent::stdout(json!({"action": "TOKEN", "token": "abc"})))
            .unwrap();

        assert_eq!(context.token().unwrap().as_deref(), Some("abc"));
        assert_eq!(context.mode().unwrap(), ProcessMode::Idle);
        assert!(context.sessions().unwrap().is_empty());
    }

    #[test]
    fn test_scoped_listener_cancelled_on_drop() {
        let manager = Arc::new(StateManager::new());
        let context = ProcessContext::new(manager.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let guard = {
            let calls = calls.clone();
            context
                .listen_scoped(
                    EventKind::Terminated,
                    handler(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap()
        };

        manager.handle_event(InboundEvent::terminated()).unwrap();
        drop(guard);
        manager.handle_event(InboundEvent::terminated()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.listener_count(EventKind::Terminated), 0);
    }

    #[test]
    fn test_guard_cancel_is_single_shot() {
        let manager = Arc::new(StateManager::new());
        let context = ProcessContext::new(manager.clone());
        let guard = context
            .listen_scoped(EventKind::Started, handler(|_| Ok(())))
            .unwrap();

        assert!(guard.subscription().is_some());
        assert!(guard.cancel());
        assert_eq!(manager.listener_count(EventKind::Started), 0);
    }
}
