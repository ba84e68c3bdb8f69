//! `ps2vm soak`: concurrent transition stress.
//!
//! Every thread issues a random mix of pause, resume and suspend requests.
//! Afterwards the published mode changes must form one legal chain.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use ps2vm_core::{Emulator, EventSink, ExecMode, VmConfig, VmEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

pub struct SoakArgs {
    pub threads: usize,
    pub ops: usize,
    pub seed: Option<u64>,
}

#[derive(Default)]
struct Tally {
    /// Requests by kind and outcome
    outcomes: BTreeMap<(&'static str, &'static str), u64>,
}

impl Tally {
    fn record(&mut self, request: &'static str, outcome: &'static str) {
        *self.outcomes.entry((request, outcome)).or_insert(0) += 1;
    }
}

pub fn execute(mut config: VmConfig, args: SoakArgs) -> anyhow::Result<()> {
    // Short frames keep the worker reaching its checkpoint quickly.
    config.cpu.frame_slice_us = config.cpu.frame_slice_us.min(100);
    let seed = args.seed.unwrap_or_else(rand::random);
    println!(
        "Soaking with {} threads x {} requests (seed {})",
        args.threads, args.ops, seed
    );

    let (sink, events) = EventSink::channel();
    let emu = Emulator::headless(config, sink).context("Failed to create emulator")?;
    emu.start()?;
    emu.resume()?;

    let tally = Arc::new(Mutex::new(Tally::default()));
    let started = Instant::now();
    let handles: Vec<_> = (0..args.threads)
        .map(|i| {
            let emu = emu.clone();
            let tally = tally.clone();
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let ops = args.ops;
            thread::Builder::new()
                .name(format!("soak-{}", i))
                .spawn(move || -> anyhow::Result<()> {
                    for _ in 0..ops {
                        let (request, result) = match rng.gen_range(0..4) {
                            0 => ("pause", emu.pause()),
                            1 => ("resume", emu.resume()),
                            2 => ("suspend", emu.suspend(false)),
                            _ => ("suspend-blocking", emu.suspend(true)),
                        };
                        let outcome = match result {
                            Ok(true) => "changed",
                            Ok(false) => "no-op",
                            Err(e) if e.is_cancellation() => "rejected",
                            Err(e) => bail!("{} failed: {}", request, e),
                        };
                        tally.lock().record(request, outcome);
                    }
                    Ok(())
                })
                .context("Failed to spawn soak thread")
        })
        .collect::<anyhow::Result<_>>()?;

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("soak thread panicked"),
        }
    }
    let elapsed = started.elapsed();

    emu.resume()?;
    let frames = emu.frame_count();
    emu.shutdown();

    let mut transitions = Vec::new();
    for event in events.try_iter() {
        match event {
            VmEvent::ModeChanged { from, to } => transitions.push((from, to)),
            VmEvent::WorkerError(e) => bail!("worker reported an error: {}", e),
            _ => {}
        }
    }
    verify_chain(&transitions)?;

    for ((request, outcome), count) in &tally.lock().outcomes {
        println!("  {:<18} {:<8} {}", request, outcome, count);
    }
    println!(
        "OK: {} transitions verified, {} frames executed in {:.2?}",
        transitions.len(),
        frames,
        elapsed
    );
    Ok(())
}

fn verify_chain(transitions: &[(ExecMode, ExecMode)]) -> anyhow::Result<()> {
    let mut current = ExecMode::NotStarted;
    for (i, &(from, to)) in transitions.iter().enumerate() {
        if from != current {
            bail!("transition {} starts at {} but the VM was {}", i, from, current);
        }
        if !from.can_transition_to(to) {
            bail!("transition {} is illegal: {} -> {}", i, from, to);
        }
        current = to;
    }
    Ok(())
}
