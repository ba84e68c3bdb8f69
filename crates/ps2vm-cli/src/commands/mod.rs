//! Subcommand implementations

pub mod config;
pub mod run;
pub mod savestate;
pub mod soak;

use anyhow::bail;
use ps2vm_core::{Emulator, EventReceiver, VmEvent};
use std::thread;
use std::time::{Duration, Instant};

/// Let the VM run until it has executed `frames` frames.
///
/// Fails on a worker error or when `timeout` passes first.
pub fn run_frames(
    emu: &Emulator,
    events: &EventReceiver,
    frames: u64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    while emu.frame_count() < frames {
        for event in events.try_iter() {
            if let VmEvent::WorkerError(e) = event {
                bail!("Emulation worker failed: {}", e);
            }
        }
        if Instant::now() >= deadline {
            bail!(
                "Timed out after {:?} at frame {} of {}",
                timeout,
                emu.frame_count(),
                frames
            );
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}
