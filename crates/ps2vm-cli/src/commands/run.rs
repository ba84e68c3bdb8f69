//! `ps2vm run`: boot, run a number of frames, pause, tear down.

use anyhow::Context;
use ps2vm_core::{Emulator, EventSink, VmConfig, VmEvent};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub struct RunArgs {
    pub frames: u64,
    pub elf: Option<PathBuf>,
    pub timeout_secs: u64,
}

pub fn execute(mut config: VmConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(elf) = args.elf {
        config.boot.elf = Some(elf);
        config.boot.fast_boot = true;
    }

    let (sink, events) = EventSink::channel();
    let emu = Emulator::headless(config, sink).context("Failed to create emulator")?;

    let started = Instant::now();
    emu.start().context("Failed to start the emulation worker")?;
    emu.resume().context("Failed to resume the VM")?;

    let outcome = super::run_frames(
        &emu,
        &events,
        args.frames,
        Duration::from_secs(args.timeout_secs),
    );
    if outcome.is_ok() {
        emu.pause().context("Failed to pause the VM")?;
        let elapsed = started.elapsed();
        let frames = emu.frame_count();
        println!(
            "Ran {} frames in {:.2?} ({:.1} frames/s)",
            frames,
            elapsed,
            frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }

    emu.cancel(true).context("Failed to stop the emulation worker")?;
    emu.shutdown();

    let transitions = events
        .try_iter()
        .filter(|e| matches!(e, VmEvent::ModeChanged { .. }))
        .count();
    log::debug!("{} mode transitions observed", transitions);

    outcome
}
