//! CPU execution entry point.
//!
//! The orchestration core never looks inside the CPU: it calls
//! `execute_slice` once per worker iteration and only interrupts between
//! slices.

use crate::config::CpuConfig;
use crate::error::VmResult;
use std::path::Path;

/// The CPU collaborator driven by the emulation worker.
pub trait CpuCore: Send {
    /// Reset architectural state (cold boot).
    fn reset(&mut self);

    /// Drop recompiled code blocks.
    fn clear_caches(&mut self);

    /// Apply new settings; takes effect on the next slice.
    fn apply_settings(&mut self, config: &CpuConfig);

    /// Load an ELF and jump straight to its entry point.
    fn fast_boot(&mut self, elf: &Path) -> VmResult<()>;

    /// Run one virtual frame.
    fn execute_slice(&mut self) -> VmResult<()>;

    /// Virtual frames executed since the last reset.
    fn frame_count(&self) -> u64;

    /// Serialise CPU-visible state.
    fn freeze(&self) -> VmResult<Vec<u8>>;

    /// Restore CPU-visible state.
    fn thaw(&mut self, data: &[u8]) -> VmResult<()>;
}
