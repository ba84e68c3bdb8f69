//! PS2 VM Orchestration Core
//!
//! This crate decides when the emulation thread runs, pauses, closes and
//! shuts down, and serializes every cross-thread request that changes it:
//! - **Executor**: one thread and FIFO queue for state-mutating calls (`executor` module)
//! - **Exec mode**: the worker's suspend/resume state machine (`exec_mode` module)
//! - **Worker**: the emulation thread and its checkpoint hooks (`worker` module)
//! - **Guards**: scoped pause/close/popup helpers (`guards` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use ps2vm_core::{Emulator, EventSink, GuardContext, ScopedPause, VmConfig};
//!
//! let emu = Emulator::headless(VmConfig::default(), EventSink::disconnected())?;
//! emu.start()?;
//! emu.resume()?;
//!
//! let ctx = GuardContext::new();
//! {
//!     let mut guard = ScopedPause::new(&emu, &ctx)?;
//!     let state = emu.freeze_state(&guard)?;
//!     guard.allow_resume();
//! }
//! emu.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Command executor: serialized cross-thread requests
pub mod executor;

/// Exec-mode state machine of the emulation worker
pub mod exec_mode;

/// Emulation worker thread
pub mod worker;

/// Scoped pause/close/popup guards
pub mod guards;

/// Controller facade
pub mod emulator;

// ============================================================================
// Collaborators and Support
// ============================================================================

/// Configuration file
pub mod config;

/// CPU entry point
pub mod cpu;

/// Error types
pub mod error;

/// Asynchronous notifications
pub mod events;

/// Headless CPU and plugin implementations
pub mod headless;

/// Plugin lifecycle management
pub mod plugins;

/// Savestate snapshots
pub mod savestate;

/// Synchronization primitives
pub mod sync;

/// CPU plus plugins
pub mod vm;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{
    BootConfig, ConfigError, CpuConfig, ExecutorConfig, GsConfig, PluginsConfig, VmConfig,
    CONFIG_FILE_NAME,
};
pub use cpu::CpuCore;
pub use emulator::Emulator;
pub use error::{VmError, VmResult};
pub use events::{EventReceiver, EventSink, VmEvent};
pub use exec_mode::{CheckpointHooks, ExecMode, ExecModeStateMachine, SuspendKind};
pub use executor::{CommandExecutor, ResultSlot, SyncAction};
pub use guards::{GuardContext, ScopedClose, ScopedPause, ScopedPopup, VmSuspended};
pub use headless::{HeadlessCpu, NullPlugin};
pub use plugins::{Plugin, PluginId, PluginManager};
pub use savestate::{SaveState, SaveStateError};
pub use vm::{PluginFactory, SharedVm, VirtualMachine};
pub use worker::EmulationWorker;
