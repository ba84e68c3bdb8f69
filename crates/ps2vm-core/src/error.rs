//! Core error types.
//!
//! Errors cross thread boundaries by value: the executor moves a `VmError`
//! into the caller's result slot, and the caller decides whether to raise it.

use crate::exec_mode::ExecMode;
use crate::plugins::PluginId;
use std::time::Duration;

/// Errors produced by the emulation orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A state change was requested that conflicts with a transition already
    /// in flight (e.g. a non-blocking suspend while a pause is settling).
    #[error("Cannot {requested} while the VM is {from}")]
    InvalidTransition {
        /// Mode observed when the request was rejected
        from: ExecMode,
        /// Name of the rejected operation
        requested: &'static str,
    },

    /// The emulation worker has not been started
    #[error("Emulation worker is not started")]
    NotStarted,

    /// The emulation worker is already running
    #[error("Emulation worker is already started")]
    AlreadyStarted,

    /// The worker thread observed a cancellation request
    #[error("Emulation worker was cancelled")]
    ThreadCancelled,

    /// The worker thread left its loop (cancelled or failed) and must be
    /// started again
    #[error("Emulation worker has exited")]
    WorkerExited,

    /// The command executor shut down before the action ran
    #[error("Action was discarded before execution (executor shutting down)")]
    NotExecuted,

    /// The action panicked on the executor thread
    #[error("Action panicked: {0}")]
    ActionPanicked(String),

    /// The worker did not acknowledge a suspend request in time
    #[error("Worker did not reach a stopped state within {waited:?}")]
    StopTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// A plugin failed to open
    #[error("{plugin} plugin failed to open: {reason}")]
    PluginOpen {
        /// Failing plugin
        plugin: PluginId,
        /// Plugin-provided reason
        reason: String,
    },

    /// A plugin failed to initialise
    #[error("{plugin} plugin failed to initialize: {reason}")]
    PluginInit {
        /// Failing plugin
        plugin: PluginId,
        /// Plugin-provided reason
        reason: String,
    },

    /// A plugin could not serialise its state
    #[error("{plugin} plugin failed to freeze its state: {reason}")]
    PluginFreeze {
        /// Failing plugin
        plugin: PluginId,
        /// Plugin-provided reason
        reason: String,
    },

    /// A plugin rejected a saved state
    #[error("{plugin} plugin failed to thaw its state: {reason}")]
    PluginThaw {
        /// Failing plugin
        plugin: PluginId,
        /// Plugin-provided reason
        reason: String,
    },

    /// The CPU entry point reported a failure
    #[error("CPU error: {0}")]
    Cpu(String),

    /// A thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl VmError {
    /// True for errors that only mean "your request was redundant or
    /// superseded" and are normally retried or ignored.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            VmError::InvalidTransition { .. } | VmError::ThreadCancelled | VmError::NotExecuted
        )
    }

    /// True for plugin lifecycle failures.
    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            VmError::PluginOpen { .. }
                | VmError::PluginInit { .. }
                | VmError::PluginFreeze { .. }
                | VmError::PluginThaw { .. }
        )
    }
}

/// Result alias used throughout the core.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        let err = VmError::InvalidTransition {
            from: ExecMode::Pausing,
            requested: "suspend",
        };
        assert!(err.is_cancellation());
        assert!(!err.is_plugin_error());
        assert!(VmError::NotExecuted.is_cancellation());
        assert!(!VmError::Cpu("bad opcode".into()).is_cancellation());
        assert!(!VmError::WorkerExited.is_cancellation());
    }

    #[test]
    fn test_error_messages() {
        let err = VmError::InvalidTransition {
            from: ExecMode::Paused,
            requested: "suspend",
        };
        assert_eq!(err.to_string(), "Cannot suspend while the VM is Paused");

        let err = VmError::PluginOpen {
            plugin: PluginId::Gs,
            reason: "no window".into(),
        };
        assert!(err.is_plugin_error());
        assert_eq!(err.to_string(), "GS plugin failed to open: no window");
    }
}
