//! ps2vm headless controller
//!
//! Drives the emulation core from the command line, playing the UI thread's
//! role: starting and resuming the VM, pausing it for savestates, and
//! hammering the state machine from many threads.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ps2vm_core::{VmConfig, CONFIG_FILE_NAME};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ps2vm")]
#[command(about = "Headless PS2 VM controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./ps2vm.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the VM and run a number of frames
    Run {
        /// Frames to run before stopping
        #[arg(short, long, default_value_t = 120)]
        frames: u64,
        /// ELF to fast-boot
        #[arg(long)]
        elf: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Issue random pause/resume/suspend requests from many threads and
    /// verify every observed transition
    Soak {
        /// Controller threads
        #[arg(short, long, default_value_t = 8)]
        threads: usize,
        /// Requests per thread
        #[arg(short, long, default_value_t = 200)]
        ops: usize,
        /// RNG seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run some frames, then write a savestate taken under a pause
    Savestate {
        /// Output file (JSON)
        #[arg(short, long, default_value = "ps2vm-state.json")]
        out: PathBuf,
        /// Frames to run before freezing
        #[arg(short, long, default_value_t = 60)]
        frames: u64,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write it to this file instead
        #[arg(long)]
        write: Option<PathBuf>,
        /// Print the built-in defaults, ignoring any config file
        #[arg(long)]
        defaults: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VmConfig> {
    match path {
        Some(path) => VmConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => VmConfig::load_or_default(std::path::Path::new(CONFIG_FILE_NAME))
            .with_context(|| format!("Failed to load {}", CONFIG_FILE_NAME)),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            frames,
            elf,
            timeout,
        } => {
            let config = load_config(cli.config.as_ref())?;
            commands::run::execute(
                config,
                commands::run::RunArgs {
                    frames,
                    elf,
                    timeout_secs: timeout,
                },
            )
        }

        Commands::Soak { threads, ops, seed } => {
            let config = load_config(cli.config.as_ref())?;
            commands::soak::execute(config, commands::soak::SoakArgs { threads, ops, seed })
        }

        Commands::Savestate { out, frames } => {
            let config = load_config(cli.config.as_ref())?;
            commands::savestate::execute(config, &out, frames)
        }

        Commands::Config { write, defaults } => {
            let config = if defaults {
                VmConfig::default()
            } else {
                load_config(cli.config.as_ref())?
            };
            commands::config::execute(&config, write.as_deref())
        }
    }
}
