//! Headless collaborators
//!
//! A frame-counting CPU and an inert plugin, enough to drive the core
//! without real hardware emulation (CLI runs, soak tests, benchmarks).

use crate::config::CpuConfig;
use crate::cpu::CpuCore;
use crate::error::{VmError, VmResult};
use crate::plugins::Plugin;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// CPU stand-in that "executes" a frame by sleeping for the configured
/// slice length and counting it.
#[derive(Debug, Default)]
pub struct HeadlessCpu {
    frames: u64,
    slice: Duration,
    recompiler: bool,
    cache_generation: u64,
    booted_elf: Option<PathBuf>,
}

impl HeadlessCpu {
    /// Create a CPU using `config`.
    pub fn new(config: &CpuConfig) -> Self {
        let mut cpu = Self::default();
        cpu.apply_settings(config);
        cpu
    }

    /// Number of times the recompiler caches were cleared.
    pub fn cache_generation(&self) -> u64 {
        self.cache_generation
    }

    /// ELF passed to the last fast boot.
    pub fn booted_elf(&self) -> Option<&Path> {
        self.booted_elf.as_deref()
    }

    /// Whether the recompiler is selected.
    pub fn uses_recompiler(&self) -> bool {
        self.recompiler
    }
}

impl CpuCore for HeadlessCpu {
    fn reset(&mut self) {
        self.frames = 0;
        self.booted_elf = None;
    }

    fn clear_caches(&mut self) {
        self.cache_generation += 1;
    }

    fn apply_settings(&mut self, config: &CpuConfig) {
        self.slice = Duration::from_micros(config.frame_slice_us);
        self.recompiler = config.recompiler;
    }

    fn fast_boot(&mut self, elf: &Path) -> VmResult<()> {
        if elf.as_os_str().is_empty() {
            return Err(VmError::Cpu("empty ELF path".to_string()));
        }
        log::info!("Fast-booting {}", elf.display());
        self.booted_elf = Some(elf.to_path_buf());
        Ok(())
    }

    fn execute_slice(&mut self) -> VmResult<()> {
        if !self.slice.is_zero() {
            thread::sleep(self.slice);
        }
        self.frames += 1;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn freeze(&self) -> VmResult<Vec<u8>> {
        Ok(self.frames.to_le_bytes().to_vec())
    }

    fn thaw(&mut self, data: &[u8]) -> VmResult<()> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| VmError::Cpu(format!("bad CPU state length {}", data.len())))?;
        self.frames = u64::from_le_bytes(bytes);
        Ok(())
    }
}

/// Plugin that accepts every lifecycle call and keeps no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlugin;

impl Plugin for NullPlugin {
    fn init(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn open(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_cpu_counts_frames() {
        let mut cpu = HeadlessCpu::new(&CpuConfig {
            recompiler: false,
            frame_slice_us: 0,
        });
        cpu.execute_slice().unwrap();
        cpu.execute_slice().unwrap();
        assert_eq!(cpu.frame_count(), 2);
        assert!(!cpu.uses_recompiler());

        let state = cpu.freeze().unwrap();
        cpu.reset();
        assert_eq!(cpu.frame_count(), 0);
        cpu.thaw(&state).unwrap();
        assert_eq!(cpu.frame_count(), 2);
        assert!(cpu.thaw(&[1, 2]).is_err());
    }

    #[test]
    fn test_fast_boot_records_elf() {
        let mut cpu = HeadlessCpu::default();
        cpu.fast_boot(Path::new("demo.elf")).unwrap();
        assert_eq!(cpu.booted_elf(), Some(Path::new("demo.elf")));
        assert!(cpu.fast_boot(Path::new("")).is_err());
    }
}
