//! Queued units of work and their synchronous result slots

use crate::error::{VmError, VmResult};
use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type Payload = Box<dyn FnOnce() -> VmResult<()> + Send + 'static>;

/// Semaphore-backed box that carries an action's outcome back to the thread
/// that is blocked on it.
///
/// Only the first resolution is kept; later ones are ignored.
pub struct ResultSlot {
    outcome: Mutex<Option<VmResult<()>>>,
    done: Semaphore,
}

impl ResultSlot {
    /// Create an unresolved slot.
    pub fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Semaphore::new(0),
        }
    }

    /// Store the outcome and wake the waiter.
    pub fn resolve(&self, outcome: VmResult<()>) {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.done.post();
    }

    /// Whether an outcome has been stored.
    pub fn is_resolved(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Block until resolved and take the outcome.
    pub fn wait(&self) -> VmResult<()> {
        self.done.wait();
        self.outcome.lock().take().unwrap_or(Err(VmError::NotExecuted))
    }
}

impl Default for ResultSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work for the command executor.
///
/// Ownership moves into the queue on post; the executor drops the action
/// right after invoking (or discarding) it.
pub struct SyncAction {
    /// Label used in logs and failure events
    name: &'static str,

    /// The work itself
    payload: Payload,

    /// Runs even when the queue shuts down, whether queued before or after
    critical: bool,

    /// Present when a caller is blocked waiting for the outcome
    slot: Option<Arc<ResultSlot>>,
}

impl SyncAction {
    /// Wrap a closure as a cancellable, non-critical action.
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() -> VmResult<()> + Send + 'static,
    {
        Self {
            name,
            payload: Box::new(f),
            critical: false,
            slot: None,
        }
    }

    /// Mark the action critical: it runs even during shutdown.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Attach a result slot.
    pub fn with_slot(mut self, slot: Arc<ResultSlot>) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Action label.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the action is critical.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Whether shutdown may drop the action once queued.
    pub fn allows_cancel(&self) -> bool {
        !self.critical
    }

    /// Whether a caller is blocked on this action.
    pub fn is_synchronous(&self) -> bool {
        self.slot.is_some()
    }

    /// Run the payload, catching panics at the boundary.
    ///
    /// For synchronous actions the outcome goes to the slot and `None` is
    /// returned; for fire-and-forget actions a failure is returned for the
    /// executor to report.
    pub(crate) fn invoke(self) -> Option<VmError> {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(self.payload)) {
            Ok(result) => result,
            Err(panic) => Err(VmError::ActionPanicked(panic_message(panic.as_ref()))),
        };
        match self.slot {
            Some(slot) => {
                slot.resolve(outcome);
                None
            }
            None => outcome.err(),
        }
    }

    /// Drop the payload without running it.
    pub(crate) fn discard(self) {
        if let Some(slot) = self.slot {
            slot.resolve(Err(VmError::NotExecuted));
        }
    }
}

impl std::fmt::Debug for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAction")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .field("synchronous", &self.slot.is_some())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_resolves_slot() {
        let slot = Arc::new(ResultSlot::new());
        let action = SyncAction::new("ok", || Ok(())).with_slot(slot.clone());
        assert!(action.invoke().is_none());
        assert!(slot.is_resolved());
        assert!(slot.wait().is_ok());
    }

    #[test]
    fn test_fire_and_forget_returns_failure() {
        let action = SyncAction::new("fails", || Err(VmError::Cpu("boom".into())));
        assert!(matches!(action.invoke(), Some(VmError::Cpu(_))));
    }

    #[test]
    fn test_panic_is_caught() {
        let slot = Arc::new(ResultSlot::new());
        let action = SyncAction::new("panics", || panic!("kaboom")).with_slot(slot.clone());
        action.invoke();
        match slot.wait() {
            Err(VmError::ActionPanicked(msg)) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_discard_resolves_not_executed() {
        let slot = Arc::new(ResultSlot::new());
        SyncAction::new("dropped", || Ok(()))
            .with_slot(slot.clone())
            .discard();
        assert!(matches!(slot.wait(), Err(VmError::NotExecuted)));
    }

    #[test]
    fn test_first_resolution_wins() {
        let slot = ResultSlot::new();
        slot.resolve(Ok(()));
        slot.resolve(Err(VmError::NotExecuted));
        assert!(slot.wait().is_ok());
    }

    #[test]
    fn test_flags() {
        let action = SyncAction::new("teardown", || Ok(())).critical();
        assert!(action.is_critical());
        assert!(!action.allows_cancel());
        assert!(!action.is_synchronous());

        let action = SyncAction::new("flush", || Ok(()));
        assert!(!action.is_critical());
        assert!(action.allows_cancel());
    }
}
