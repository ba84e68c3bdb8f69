//! Savestates
//!
//! Freezing and thawing touch VM memory, so both take a [`VmSuspended`]
//! proof: a live guard that keeps the worker off the machine.

use crate::emulator::Emulator;
use crate::error::{VmError, VmResult};
use crate::guards::VmSuspended;
use crate::plugins::PluginId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Version written into every savestate.
pub const SAVESTATE_VERSION: u32 = 1;

/// Errors that can occur while reading or writing a savestate file
#[derive(Debug, Error)]
pub enum SaveStateError {
    /// Failed to read or write the file
    #[error("Failed to access savestate: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("Failed to parse savestate: {0}")]
    Json(#[from] serde_json::Error),

    /// Written by an incompatible version
    #[error("Unsupported savestate version {found} (expected {expected})")]
    Version {
        /// Version found in the file
        found: u32,
        /// Version this build writes
        expected: u32,
    },
}

/// Snapshot of CPU and plugin state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    /// Format version
    pub version: u32,

    /// Virtual frame the snapshot was taken at
    pub frame: u64,

    /// CPU state blob
    pub cpu: Vec<u8>,

    /// Per-plugin state blobs, in plugin order
    pub plugins: Vec<(PluginId, Vec<u8>)>,
}

impl SaveState {
    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String, SaveStateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse JSON, rejecting other format versions.
    pub fn from_json(text: &str) -> Result<Self, SaveStateError> {
        let state: SaveState = serde_json::from_str(text)?;
        if state.version != SAVESTATE_VERSION {
            return Err(SaveStateError::Version {
                found: state.version,
                expected: SAVESTATE_VERSION,
            });
        }
        Ok(state)
    }

    /// Write to `path`.
    pub fn save(&self, path: &Path) -> Result<(), SaveStateError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from `path`.
    pub fn load(path: &Path) -> Result<Self, SaveStateError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl Emulator {
    /// Snapshot the VM. `guard` must suspend this emulator.
    pub fn freeze_state(&self, guard: &impl VmSuspended) -> VmResult<SaveState> {
        self.check_guard(guard, "freeze state")?;
        let mut vm = self.vm().lock();
        let state = SaveState {
            version: SAVESTATE_VERSION,
            frame: vm.cpu.frame_count(),
            cpu: vm.cpu.freeze()?,
            plugins: vm.plugins.freeze()?,
        };
        log::info!("Froze state at frame {}", state.frame);
        Ok(state)
    }

    /// Restore a snapshot. `guard` must suspend this emulator.
    pub fn thaw_state(&self, guard: &impl VmSuspended, state: &SaveState) -> VmResult<()> {
        self.check_guard(guard, "thaw state")?;
        let mut vm = self.vm().lock();
        vm.cpu.thaw(&state.cpu)?;
        vm.plugins.thaw(&state.plugins)?;
        vm.cpu.clear_caches();
        log::info!("Thawed state from frame {}", state.frame);
        Ok(())
    }

    fn check_guard(&self, guard: &impl VmSuspended, requested: &'static str) -> VmResult<()> {
        if guard.suspended_emulator().ptr_eq(self) {
            Ok(())
        } else {
            Err(VmError::InvalidTransition {
                from: self.exec_mode(),
                requested,
            })
        }
    }
}
