//! Experiment configuration

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use meshgpt_core::{GptConfig, Policy};
use meshgpt_optimizer::AdamWConfig;
use serde::{Deserialize, Serialize};

/// Everything a training run needs besides the data itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Holds `ckpt_mngr/` and `logs/`.
    pub rundir: PathBuf,
    /// Holds `train.bin`, `val.bin` and optionally `meta.json`.
    pub data_dir: PathBuf,
    pub learning_rate: f64,
    /// Global batch size across all devices, per microbatch.
    pub batch_size: usize,
    pub warmup_steps: usize,
    pub min_lr: f64,
    pub lr_decay_steps: usize,
    pub max_steps: usize,
    pub beta2: f64,
    pub weight_decay: f64,
    pub eval_interval: usize,
    pub eval_iters: usize,
    /// jmp-style policy string. Takes precedence over the dtype fields.
    pub policy: Option<String>,
    pub param_dtype: String,
    pub compute_dtype: String,
    pub g_accum_iters: usize,
    pub shard_model: bool,
    pub seed: u64,
    pub max_to_keep: usize,
    /// Defaults to `eval_interval`.
    pub checkpoint_interval: Option<usize>,
    /// Skip evaluation and checkpointing.
    pub debug: bool,
    pub model_config: GptConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::shakespeare_char()
    }
}

impl ExperimentConfig {
    pub fn shakespeare_char() -> Self {
        Self {
            rundir: PathBuf::from("runs/shakespeare_char"),
            data_dir: PathBuf::from("data/shakespeare_char"),
            learning_rate: 1e-3,
            batch_size: 64,
            warmup_steps: 100,
            min_lr: 1e-4,
            lr_decay_steps: 5000,
            max_steps: 5000,
            beta2: 0.99,
            weight_decay: 0.1,
            eval_interval: 2000,
            eval_iters: 200,
            policy: None,
            param_dtype: "float32".to_string(),
            compute_dtype: "float32".to_string(),
            g_accum_iters: 1,
            shard_model: false,
            seed: 0,
            max_to_keep: 1,
            checkpoint_interval: None,
            debug: false,
            model_config: GptConfig::shakespeare_char(),
        }
    }

    /// GPT-2 124M on OpenWebText.
    pub fn openwebtext() -> Self {
        Self {
            rundir: PathBuf::from("runs/openwebtext"),
            data_dir: PathBuf::from("data/openwebtext"),
            learning_rate: 6e-4,
            batch_size: 120,
            warmup_steps: 5000,
            min_lr: 1e-5,
            lr_decay_steps: 600_000,
            max_steps: 600_000,
            beta2: 0.95,
            weight_decay: 6e-5,
            eval_interval: 1000,
            compute_dtype: "bfloat16".to_string(),
            g_accum_iters: 4,
            model_config: GptConfig::gpt2_small(),
            ..Self::shakespeare_char()
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "shakespeare-char" | "shakespeare_char" => Ok(Self::shakespeare_char()),
            "openwebtext" | "owt" => Ok(Self::openwebtext()),
            other => bail!("unknown preset `{}`, use shakespeare-char or openwebtext", other),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn policy(&self) -> Result<Policy> {
        let policy = match &self.policy {
            Some(text) => Policy::parse(text)?,
            None => Policy::new(
                meshgpt_core::precision::parse_dtype(&self.param_dtype)?,
                meshgpt_core::precision::parse_dtype(&self.compute_dtype)?,
            ),
        };
        Ok(policy)
    }

    pub fn optimizer_config(&self) -> AdamWConfig {
        AdamWConfig {
            peak_lr: self.learning_rate,
            min_lr: self.min_lr,
            warmup_steps: self.warmup_steps,
            lr_decay_steps: self.lr_decay_steps,
            beta2: self.beta2,
            weight_decay: self.weight_decay,
            ..AdamWConfig::default()
        }
    }

    pub fn checkpoint_interval(&self) -> usize {
        self.checkpoint_interval.unwrap_or(self.eval_interval)
    }

    /// Sequences consumed per optimizer step.
    pub fn sequences_per_step(&self) -> usize {
        self.batch_size * self.g_accum_iters
    }

    /// Take the vocabulary size from `<data_dir>/meta.json` when the
    /// dataset ships one.
    pub fn resolve_vocab_size(mut self) -> Result<Self> {
        if let Some(vocab_size) = read_vocab_size(&self.data_dir)? {
            tracing::info!("vocab_size {} from {}", vocab_size, self.data_dir.display());
            self.model_config.vocab_size = vocab_size;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.model_config.validate()?;
        self.policy()?;
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("g_accum_iters", self.g_accum_iters),
            ("eval_interval", self.eval_interval),
            ("eval_iters", self.eval_iters),
            ("max_to_keep", self.max_to_keep),
            ("checkpoint_interval", self.checkpoint_interval()),
        ] {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        if self.learning_rate < 0.0 || self.min_lr < 0.0 {
            bail!("learning rates must be non-negative");
        }
        if !(0.0..1.0).contains(&self.beta2) {
            bail!("beta2 must be in [0, 1), got {}", self.beta2);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct DatasetMeta {
    vocab_size: usize,
}

pub fn read_vocab_size(data_dir: &Path) -> Result<Option<usize>> {
    let path = data_dir.join("meta.json");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let meta: DatasetMeta =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(meta.vocab_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::tempdir;

    #[test]
    fn test_presets_validate() -> Result<()> {
        ExperimentConfig::shakespeare_char().validate()?;
        ExperimentConfig::openwebtext().validate()?;
        assert_eq!(ExperimentConfig::preset("owt")?, ExperimentConfig::openwebtext());
        assert!(ExperimentConfig::preset("tinystories").is_err());
        Ok(())
    }

    #[test]
    fn test_policy_resolution() -> Result<()> {
        let owt = ExperimentConfig::openwebtext();
        let policy = owt.policy()?;
        assert_eq!(policy.param_dtype, DType::F32);
        assert_eq!(policy.compute_dtype, DType::BF16);

        let explicit = ExperimentConfig {
            policy: Some("params=bfloat16,compute=bfloat16,output=float32".to_string()),
            ..owt
        };
        assert_eq!(explicit.policy()?.output_dtype, DType::F32);
        assert_eq!(explicit.policy()?.param_dtype, DType::BF16);
        Ok(())
    }

    #[test]
    fn test_json_round_trip_with_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"batch_size": 8, "max_steps": 10}"#)?;

        let config = ExperimentConfig::from_json_file(&path)?;
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.eval_iters, 200);
        assert_eq!(config.checkpoint_interval(), config.eval_interval);

        config.save_json(&path)?;
        assert_eq!(ExperimentConfig::from_json_file(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_vocab_from_meta() -> Result<()> {
        let dir = tempdir()?;
        let config = ExperimentConfig {
            data_dir: dir.path().to_path_buf(),
            ..ExperimentConfig::openwebtext()
        };
        let unchanged = config.clone().resolve_vocab_size()?;
        assert_eq!(unchanged.model_config.vocab_size, 50304);

        std::fs::write(dir.path().join("meta.json"), r#"{"vocab_size": 65, "itos": {}}"#)?;
        let resolved = config.resolve_vocab_size()?;
        assert_eq!(resolved.model_config.vocab_size, 65);
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        let zero_accum = ExperimentConfig {
            g_accum_iters: 0,
            ..ExperimentConfig::default()
        };
        assert!(zero_accum.validate().is_err());

        let bad_dtype = ExperimentConfig {
            compute_dtype: "float8".to_string(),
            ..ExperimentConfig::default()
        };
        assert!(bad_dtype.validate().is_err());
    }
}
