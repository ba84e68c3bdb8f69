//! Asynchronous notifications for the UI layer.
//!
//! Anything that cannot be handed back to a blocked caller (fire-and-forget
//! failures, worker-side errors, mode changes) is published here instead.

use crate::error::VmError;
use crate::exec_mode::ExecMode;
use crossbeam::channel::{self, Receiver, Sender};

/// A notification published by the core.
#[derive(Debug)]
pub enum VmEvent {
    /// The exec-mode state machine changed state
    ModeChanged {
        /// Previous mode
        from: ExecMode,
        /// New mode
        to: ExecMode,
    },

    /// A fire-and-forget executor action failed
    ActionFailed {
        /// Action label
        action: &'static str,
        /// Failure
        error: VmError,
    },

    /// The emulation worker hit an error at a checkpoint or in a CPU slice
    WorkerError(VmError),

    /// The emulation worker thread finished its terminal cleanup
    WorkerExited,
}

/// Receiving end of the event channel.
pub type EventReceiver = Receiver<VmEvent>;

/// Cloneable publishing end of the event channel.
///
/// Sends never block and are silently dropped once every receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<VmEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiver.
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Publish an event.
    pub fn publish(&self, event: VmEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::disconnected()
    }
}
