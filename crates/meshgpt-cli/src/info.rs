//! Info subcommand - parameter counts and memory per device

use anyhow::Result;
use meshgpt_core::{shard_params, DeviceMesh, Gpt, LanguageModel, RngKey};
use meshgpt_training::ExperimentConfig;

pub fn run(config: ExperimentConfig, devices: Option<usize>) -> Result<()> {
    let config = config.resolve_vocab_size()?;
    config.validate()?;
    let model_config = &config.model_config;
    let policy = config.policy()?;
    let mesh = DeviceMesh::discover(devices)?;

    println!("\n=== meshgpt model info ===\n");
    println!("  Parameters:               {}", model_config.num_params());
    println!("  Non-embedding parameters: {}", model_config.num_non_embedding_params());
    println!("  Precision:                {}", policy);
    println!("  Devices:                  {} (axis `{}`)", mesh.size(), mesh.axis_name());

    let model = Gpt::new(model_config.clone())?;
    let params = model.init(RngKey::new(config.seed), policy.param_dtype, mesh.primary())?;
    for shard_model in [false, true] {
        let label = if shard_model { "sharded" } else { "replicated" };
        match shard_params(&params, &mesh, shard_model) {
            Ok(placed) => println!(
                "  Slice per device ({}):   {:.1} MB",
                label,
                mesh.bytes_per_device(&placed) as f64 / 1e6
            ),
            Err(e) => println!("  Slice per device ({}):   unavailable ({})", label, e),
        }
    }

    Ok(())
}
