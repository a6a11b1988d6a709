//! meshgpt CLI - train GPT models across a device mesh
//!
//! Usage:
//!   meshgpt train --preset shakespeare-char --data-dir data/shakespeare_char
//!   meshgpt train --config run.json --devices 4
//!   meshgpt info --preset openwebtext --devices 8

mod info;
mod train;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "meshgpt",
    about = "meshgpt - data- and model-parallel GPT training",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the experiment configuration comes from.
#[derive(Args)]
struct ConfigArgs {
    /// JSON experiment configuration
    #[arg(long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in preset: shakespeare-char, openwebtext
    #[arg(long, default_value = "shakespeare-char")]
    preset: String,

    /// Number of devices in the mesh (default: all available)
    #[arg(long)]
    devices: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (or resume training) a model
    Train {
        #[command(flatten)]
        source: ConfigArgs,

        /// Run directory holding checkpoints and logs
        #[arg(long)]
        rundir: Option<PathBuf>,

        /// Directory with train.bin, val.bin and optional meta.json
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override the number of optimizer steps
        #[arg(long)]
        max_steps: Option<usize>,

        /// Skip evaluation and checkpointing
        #[arg(long)]
        debug: bool,
    },

    /// Show parameter counts and per-device memory
    Info {
        #[command(flatten)]
        source: ConfigArgs,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            source,
            rundir,
            data_dir,
            max_steps,
            debug,
        } => {
            let config = train::load_config(source.config.as_deref(), &source.preset)?;
            train::run(config, rundir, data_dir, max_steps, debug, source.devices)?;
        }

        Commands::Info { source } => {
            let config = train::load_config(source.config.as_deref(), &source.preset)?;
            info::run(config, source.devices)?;
        }
    }

    Ok(())
}
