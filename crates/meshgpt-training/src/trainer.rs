//! Training orchestration

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use meshgpt_core::{shard_params, DeviceMesh, Gpt, LanguageModel, RngKey, Split, TokenFile};
use meshgpt_optimizer::ScheduledAdamW;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::sample_batch;
use crate::checkpoint::{CheckpointManager, CheckpointOptions};
use crate::config::ExperimentConfig;
use crate::evaluate::Evaluator;
use crate::metrics::{JsonlSink, MetricsSink};
use crate::step::{TrainState, TrainStep};

/// What a finished (or resumed-and-finished) run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub first_step: usize,
    pub max_steps: usize,
    pub steps_run: usize,
    pub final_loss: Option<f32>,
    pub final_lr: Option<f64>,
    pub last_train_loss: Option<f32>,
    pub last_val_loss: Option<f32>,
    pub latest_checkpoint: Option<usize>,
    pub non_embedding_params: usize,
    pub elapsed_secs: f64,
}

pub struct Trainer<M: LanguageModel = Gpt> {
    config: ExperimentConfig,
    model: M,
    mesh: DeviceMesh,
}

impl Trainer<Gpt> {
    pub fn from_config(config: ExperimentConfig, mesh: DeviceMesh) -> Result<Self> {
        let model = Gpt::new(config.model_config.clone())?;
        Self::new(config, model, mesh)
    }
}

impl<M: LanguageModel> Trainer<M> {
    pub fn new(config: ExperimentConfig, model: M, mesh: DeviceMesh) -> Result<Self> {
        config.validate()?;
        config.policy()?.ensure_supported(mesh.devices())?;
        if config.batch_size % mesh.size() != 0 {
            bail!(
                "batch_size {} is not divisible across {} devices",
                config.batch_size,
                mesh.size()
            );
        }
        Ok(Self { config, model, mesh })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.rundir.join("ckpt_mngr")
    }

    /// Train on `<data_dir>/{train,val}.bin`, logging metrics to
    /// `<rundir>/logs/metrics.jsonl`.
    pub fn run(&self) -> Result<TrainingSummary> {
        let train = TokenFile::open_split(&self.config.data_dir, Split::Train)
            .context("opening training split")?;
        let val = TokenFile::open_split(&self.config.data_dir, Split::Val)
            .context("opening validation split")?;
        info!(
            "{} train tokens, {} val tokens",
            train.len(),
            val.len()
        );
        let mut sink = JsonlSink::create(&self.config.rundir.join("logs").join("metrics.jsonl"))?;
        self.train(train.tokens(), val.tokens(), &mut sink)
    }

    pub fn train(&self, train_data: &[u16], val_data: &[u16], sink: &mut dyn MetricsSink) -> Result<TrainingSummary> {
        let cfg = &self.config;
        let policy = cfg.policy()?;
        let optimizer = ScheduledAdamW::new(cfg.optimizer_config());
        let step_fn = TrainStep::new(&self.model, &self.mesh, &optimizer, policy, cfg.shard_model);
        let evaluator = Evaluator::new(&self.model, &self.mesh, policy, cfg.batch_size).with_iters(cfg.eval_iters);
        let block_size = self.model.config().block_size;

        info!("devices: {:?}", self.mesh.devices());
        info!("precision policy: {}", policy);

        let (init_key, loop_key) = RngKey::new(cfg.seed).split();
        let params = self.model.init(init_key, policy.param_dtype, self.mesh.primary())?;
        let params = shard_params(&params, &self.mesh, cfg.shard_model)?;
        let non_embedding_params = self.model.config().num_non_embedding_params();
        info!("Model has {} non-embedding parameters", non_embedding_params);
        info!(
            "{:.1} MB parameter slice per device",
            self.mesh.bytes_per_device(&params) as f64 / 1e6
        );
        let opt_state = optimizer.init(&params)?;
        let mut state = TrainState { params, opt_state };

        let manager = CheckpointManager::open(
            self.checkpoint_dir(),
            CheckpointOptions {
                max_to_keep: cfg.max_to_keep,
                save_interval_steps: cfg.checkpoint_interval(),
            },
        )?;
        let mut first_step = 0;
        if let Some(restored) = manager.restore_latest(&state)? {
            first_step = restored.step + 1;
            state = TrainState {
                params: shard_params(&restored.state.params, &self.mesh, cfg.shard_model)?,
                opt_state: restored.state.opt_state,
            };
            info!("resuming at step {}", first_step);
        }

        let pb = ProgressBar::new(cfg.max_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")
                .context("progress bar template")?,
        );
        pb.set_position(first_step as u64);

        let mut summary = TrainingSummary {
            first_step,
            max_steps: cfg.max_steps,
            steps_run: 0,
            final_loss: None,
            final_lr: None,
            last_train_loss: None,
            last_val_loss: None,
            latest_checkpoint: manager.latest_step()?,
            non_embedding_params,
            elapsed_secs: 0.0,
        };
        let start = Instant::now();

        for itr in first_step..cfg.max_steps {
            let (train_key, eval_key) = loop_key.fold_in(itr as u64).split();

            if !cfg.debug && itr % cfg.eval_interval == 0 {
                let (train_eval_key, val_eval_key) = eval_key.split();
                let train_loss = evaluator.evaluate(&state.params, train_data, train_eval_key)?;
                let val_loss = evaluator.evaluate(&state.params, val_data, val_eval_key)?;
                sink.record("loss/train", train_loss as f64, itr)?;
                sink.record("loss/val", val_loss as f64, itr)?;
                pb.println(format!(
                    "  Eval at step {}: train_loss={:.3} val_loss={:.3}",
                    itr, train_loss, val_loss
                ));
                summary.last_train_loss = Some(train_loss);
                summary.last_val_loss = Some(val_loss);
            }

            let (batch_key, dropout_key) = train_key.split();
            let batch = sample_batch(
                train_data,
                block_size,
                cfg.batch_size,
                Some(cfg.g_accum_iters),
                batch_key,
                self.mesh.primary(),
            )?;
            let outcome = step_fn
                .run(state, &batch, dropout_key)
                .with_context(|| format!("training step {}", itr))?;
            state = outcome.state;

            if !cfg.debug && manager.save(itr, &state, false)? {
                summary.latest_checkpoint = Some(itr);
            }

            sink.record("loss/step", outcome.loss as f64, itr)?;
            sink.record("lr", outcome.lr, itr)?;
            summary.steps_run += 1;
            summary.final_loss = Some(outcome.loss);
            summary.final_lr = Some(outcome.lr);

            let steps_per_sec = summary.steps_run as f64 / start.elapsed().as_secs_f64().max(1e-9);
            let throughput = steps_per_sec * cfg.sequences_per_step() as f64;
            pb.set_message(format!(
                "loss: {:.4} | lr: {:.2e} | {:.1} seq/s",
                outcome.loss, outcome.lr, throughput
            ));
            pb.inc(1);
            tracing::debug!("step {}: loss={:.4} grad_norm={:.4}", itr, outcome.loss, outcome.grad_norm);
        }

        if !cfg.debug && summary.steps_run > 0 {
            let last = cfg.max_steps - 1;
            if manager.save(last, &state, true)? {
                summary.latest_checkpoint = Some(last);
            }
        }
        pb.finish_with_message("done");
        sink.flush()?;

        summary.elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            "trained steps {}..{} in {:.1}s",
            first_step, cfg.max_steps, summary.elapsed_secs
        );
        Ok(summary)
    }
}
