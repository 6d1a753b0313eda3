//! Ambient per-call context
//!
//! Every public operation of the ledger and the two service layers takes a
//! [`CallContext`] as its first parameter: the audit actor (who initiated
//! the mutation) and a cooperative cancellation flag travel together as one
//! explicit value instead of hidden task-local state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when an operation observes its context cancelled before an
/// irreversible state transition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The initiator recorded on audit entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    /// Actor class, e.g. "agent", "admin", "system"
    pub actor_type: String,
    pub actor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Actor {
    pub fn new(actor_type: &str, actor_id: &str) -> Self {
        Self {
            actor_type: actor_type.to_string(),
            actor_id: actor_id.to_string(),
            ip: None,
            request_id: None,
        }
    }

    pub fn system() -> Self {
        Self::new("system", "background")
    }

    pub fn with_request(mut self, ip: &str, request_id: &str) -> Self {
        self.ip = Some(ip.to_string());
        self.request_id = Some(request_id.to_string());
        self
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor_type, self.actor_id)
    }
}

/// Cancels the paired [`CallContext`]
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Ambient call context: audit actor plus cancellation signal
#[derive(Clone, Default)]
pub struct CallContext {
    actor: Option<Actor>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(actor: Actor) -> Self {
        Self {
            actor: Some(actor),
            cancelled: None,
        }
    }

    /// Create a context together with a handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Self {
            actor: None,
            cancelled: Some(flag.clone()),
        };
        (ctx, CancelHandle(flag))
    }

    pub fn set_actor(&mut self, actor: Actor) {
        self.actor = Some(actor);
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Check the cancellation flag before an irreversible transition
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("actor", &self.actor)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_never_cancelled() {
        let ctx = CallContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_ok());
    }

    #[test]
    fn test_cancel_handle() {
        let (ctx, handle) = CallContext::cancellable();
        assert!(ctx.check_cancelled().is_ok());
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check_cancelled(), Err(Cancelled));
    }

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let (ctx, handle) = CallContext::cancellable();
        let cloned = ctx.clone();
        handle.cancel();
        assert!(cloned.is_cancelled());
    }

    #[test]
    fn test_actor_display() {
        let actor = Actor::new("admin", "ops-1").with_request("127.0.0.1", "req-9");
        assert_eq!(actor.to_string(), "admin:ops-1");
        assert_eq!(actor.ip.as_deref(), Some("127.0.0.1"));
    }
}
