//! Train subcommand

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use meshgpt_core::DeviceMesh;
use meshgpt_training::{ExperimentConfig, Trainer};

pub fn load_config(path: Option<&Path>, preset: &str) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::from_json_file(path),
        None => ExperimentConfig::preset(preset),
    }
}

pub fn run(
    mut config: ExperimentConfig,
    rundir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    max_steps: Option<usize>,
    debug: bool,
    devices: Option<usize>,
) -> Result<()> {
    if let Some(rundir) = rundir {
        config.rundir = rundir;
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    if let Some(max_steps) = max_steps {
        config.max_steps = max_steps;
    }
    config.debug |= debug;
    let config = config.resolve_vocab_size()?;
    config.validate()?;

    println!("\n=== meshgpt training ===\n");
    println!("  Run dir:        {}", config.rundir.display());
    println!("  Data dir:       {}", config.data_dir.display());
    println!("  Model:          {} layers, {} heads, {} dims, vocab {}",
        config.model_config.n_layer,
        config.model_config.n_head,
        config.model_config.n_embd,
        config.model_config.vocab_size,
    );
    println!("  Batch:          {} x {} microbatches", config.batch_size, config.g_accum_iters);
    println!("  Steps:          {}", config.max_steps);
    println!("  Precision:      {}", config.policy()?);
    println!("  Shard model:    {}", config.shard_model);

    let mesh = DeviceMesh::discover(devices).context("building device mesh")?;
    config.save_json(&config.rundir.join("config.json"))?;

    let trainer = Trainer::from_config(config, mesh)?;
    let summary = trainer.run()?;

    println!("\n  Training complete!");
    if let Some(loss) = summary.final_loss {
        println!("  Final loss:     {:.4}", loss);
    }
    if let Some(step) = summary.latest_checkpoint {
        println!("  Checkpoint:     step {} in {}", step, trainer.checkpoint_dir().display());
    }
    let summary_path = trainer.config().rundir.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    println!("  Summary:        {}", summary_path.display());

    Ok(())
}
