//! `ps2vm savestate`: run, freeze under a pause, write JSON.

use anyhow::Context;
use ps2vm_core::{Emulator, EventSink, GuardContext, ScopedPause, VmConfig};
use std::path::Path;
use std::time::Duration;

pub fn execute(config: VmConfig, out: &Path, frames: u64) -> anyhow::Result<()> {
    let (sink, events) = EventSink::channel();
    let emu = Emulator::headless(config, sink).context("Failed to create emulator")?;
    emu.start()?;
    emu.resume()?;
    super::run_frames(&emu, &events, frames, Duration::from_secs(30))?;

    let ctx = GuardContext::new();
    let state = {
        let mut guard = ScopedPause::new(&emu, &ctx).context("Failed to pause the VM")?;
        let state = emu.freeze_state(&guard)?;
        guard.allow_resume();
        state
    };

    state
        .save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!(
        "Saved frame {} ({} plugin blobs) to {}",
        state.frame,
        state.plugins.len(),
        out.display()
    );

    emu.shutdown();
    Ok(())
}
