//! The typed-handler seam (§3: "Scheduler MUST NOT dereference MixRequest
//! fields directly — it invokes typed callbacks"). MixCoordinator and Pool
//! register one handler per `OperationType`; the Scheduler treats a
//! `ScheduledOperation`'s payload as inert bytes and hands it to whichever
//! handler owns that type.

use async_trait::async_trait;
use std::sync::Arc;
use tumbler_types::{MixId, OperationId, OperationType, ScheduledOperation};

use crate::error::HandlerError;

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, op: &ScheduledOperation, cancel: CancelToken) -> Result<(), HandlerError>;
}

/// Cooperative cancellation flag (§5: "cancellation is cooperative --
/// handlers must observe the token at each suspension"). Not a true
/// preemption mechanism; a handler that never checks it cannot be killed.
#[derive(Clone)]
pub struct CancelToken(Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fired exactly once when an operation exhausts its retries and is marked
/// FAILED, or is reaped as stuck. Carries only ids, per §3's
/// id-only-cross-component-reference rule.
pub type OnFailedCallback = Arc<dyn Fn(OperationId, OperationType, Option<MixId>) + Send + Sync>;

/// Fired exactly once when an operation's handler returns `Ok`.
pub type OnCompletedCallback = Arc<dyn Fn(OperationId, OperationType, Option<MixId>) + Send + Sync>;
