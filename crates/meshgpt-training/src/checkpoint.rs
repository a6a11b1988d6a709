//! Checkpoint save and restore
//!
//! A checkpoint is the step number plus two flat leaf sequences: the
//! parameters and the optimizer state. Stores know nothing about tree
//! structure; the manager re-attaches stored leaves to the structure of a
//! freshly initialized state, so any layout drift is caught on restore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use meshgpt_core::MeshError;
use serde::{Deserialize, Serialize};

use crate::step::TrainState;

const PARAMS_FILE: &str = "params.safetensors";
const OPT_STATE_FILE: &str = "opt_state.safetensors";
const META_FILE: &str = "meta.json";

/// Step-keyed storage of flat leaf sequences.
pub trait CheckpointStore {
    /// Completed checkpoints, ascending.
    fn steps(&self) -> Result<Vec<usize>>;

    fn latest_step(&self) -> Result<Option<usize>> {
        Ok(self.steps()?.into_iter().max())
    }

    fn save(&self, step: usize, params: &[Tensor], opt_state: &[Tensor]) -> Result<()>;

    fn restore(&self, step: usize, device: &Device) -> Result<(Vec<Tensor>, Vec<Tensor>)>;

    fn delete(&self, step: usize) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    step: usize,
    params: Vec<Vec<usize>>,
    opt_state: Vec<Vec<usize>>,
}

/// `<root>/<step>/{params,opt_state}.safetensors` plus `meta.json`.
///
/// A step directory is written under a temporary name and renamed into
/// place, so an interrupted save never shows up in [`steps`].
///
/// [`steps`]: CheckpointStore::steps
pub struct SafetensorsStore {
    root: PathBuf,
}

impl SafetensorsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating checkpoint directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.root.join(step.to_string())
    }
}

fn leaf_key(i: usize) -> String {
    format!("leaf_{:05}", i)
}

fn write_leaves(path: &Path, leaves: &[Tensor]) -> Result<()> {
    let tensors = leaves
        .iter()
        .enumerate()
        .map(|(i, t)| -> Result<(String, Tensor)> { Ok((leaf_key(i), t.to_device(&Device::Cpu)?)) })
        .collect::<Result<HashMap<_, _>>>()?;
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn read_leaves(path: &Path, count: usize, device: &Device) -> Result<Vec<Tensor>> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading {}", path.display()))?;
    (0..count)
        .map(|i| {
            tensors
                .remove(&leaf_key(i))
                .with_context(|| format!("{} has no {}", path.display(), leaf_key(i)))
        })
        .collect()
}

impl CheckpointStore for SafetensorsStore {
    fn steps(&self) -> Result<Vec<usize>> {
        let mut steps = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let step = entry.file_name().to_str().and_then(|name| name.parse::<usize>().ok());
            if let Some(step) = step {
                if entry.path().join(META_FILE).exists() {
                    steps.push(step);
                }
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    fn save(&self, step: usize, params: &[Tensor], opt_state: &[Tensor]) -> Result<()> {
        let tmp = self.root.join(format!("{}.tmp", step));
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        write_leaves(&tmp.join(PARAMS_FILE), params)?;
        write_leaves(&tmp.join(OPT_STATE_FILE), opt_state)?;
        let meta = CheckpointMeta {
            step,
            params: params.iter().map(|t| t.dims().to_vec()).collect(),
            opt_state: opt_state.iter().map(|t| t.dims().to_vec()).collect(),
        };
        std::fs::write(tmp.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;

        let dir = self.step_dir(step);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::rename(&tmp, &dir)?;
        Ok(())
    }

    fn restore(&self, step: usize, device: &Device) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let dir = self.step_dir(step);
        let meta: CheckpointMeta = serde_json::from_str(
            &std::fs::read_to_string(dir.join(META_FILE))
                .with_context(|| format!("no checkpoint at step {}", step))?,
        )?;
        let params = read_leaves(&dir.join(PARAMS_FILE), meta.params.len(), device)?;
        let opt_state = read_leaves(&dir.join(OPT_STATE_FILE), meta.opt_state.len(), device)?;
        Ok((params, opt_state))
    }

    fn delete(&self, step: usize) -> Result<()> {
        std::fs::remove_dir_all(self.step_dir(step))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOptions {
    pub max_to_keep: usize,
    pub save_interval_steps: usize,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            max_to_keep: 1,
            save_interval_steps: 1,
        }
    }
}

#[derive(Debug)]
pub struct Restored {
    pub step: usize,
    pub state: TrainState,
}

pub struct CheckpointManager<S: CheckpointStore = SafetensorsStore> {
    store: S,
    options: CheckpointOptions,
}

impl CheckpointManager<SafetensorsStore> {
    pub fn open(dir: impl Into<PathBuf>, options: CheckpointOptions) -> Result<Self> {
        Ok(Self::new(SafetensorsStore::new(dir)?, options))
    }
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S, options: CheckpointOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> CheckpointOptions {
        self.options
    }

    pub fn latest_step(&self) -> Result<Option<usize>> {
        self.store.latest_step()
    }

    /// Whether `step` is on the save cadence and newer than what is stored.
    pub fn should_save(&self, step: usize) -> Result<bool> {
        if step % self.options.save_interval_steps.max(1) != 0 {
            return Ok(false);
        }
        self.is_newer(step)
    }

    fn is_newer(&self, step: usize) -> Result<bool> {
        Ok(self.latest_step()?.map_or(true, |latest| step > latest))
    }

    /// Save `state` as `step`. With `force` the cadence is ignored, but a
    /// step is never written twice. Returns whether anything was written.
    pub fn save(&self, step: usize, state: &TrainState, force: bool) -> Result<bool> {
        let due = if force {
            self.is_newer(step)?
        } else {
            self.should_save(step)?
        };
        if !due {
            return Ok(false);
        }

        let params = state.params.values();
        let opt_state = state.opt_state.leaves(&Device::Cpu)?;
        self.store
            .save(step, &params, &opt_state)
            .with_context(|| format!("saving checkpoint {}", step))?;
        tracing::info!("saved checkpoint at step {}", step);

        let steps = self.store.steps()?;
        let excess = steps.len().saturating_sub(self.options.max_to_keep.max(1));
        for old in &steps[..excess] {
            self.store.delete(*old)?;
            tracing::debug!("pruned checkpoint {}", old);
        }
        Ok(true)
    }

    /// Latest checkpoint attached to the structure of `fresh`, or `None`
    /// when nothing has been saved yet.
    pub fn restore_latest(&self, fresh: &TrainState) -> Result<Option<Restored>> {
        match self.latest_step()? {
            Some(step) => Ok(Some(Restored {
                step,
                state: self.restore(step, fresh)?,
            })),
            None => Ok(None),
        }
    }

    /// Only leaf values are taken from the store; names, kinds, shapes,
    /// dtypes and placements come from `fresh`.
    pub fn restore(&self, step: usize, fresh: &TrainState) -> Result<TrainState> {
        let fresh_params = fresh.params.values();
        let device = fresh_params
            .first()
            .map(|t| t.device().clone())
            .unwrap_or(Device::Cpu);
        let (params, opt_state) = self.store.restore(step, &device)?;

        let params = attach(&fresh_params, params, "parameters")?;
        let params = fresh.params.with_values(params)?;
        let params = fresh.params.zip_map(&params, |_, f, r| {
            let mut leaf = r.clone();
            leaf.placement = f.placement;
            Ok(leaf)
        })?;

        let fresh_opt = fresh.opt_state.leaves(&device)?;
        let opt_state = fresh.opt_state.with_values(attach(&fresh_opt, opt_state, "optimizer state")?)?;

        tracing::info!("restored checkpoint from step {}", step);
        Ok(TrainState { params, opt_state })
    }
}

/// Check stored leaves against fresh ones and cast them to the fresh
/// dtype and device.
fn attach(fresh: &[Tensor], stored: Vec<Tensor>, what: &str) -> Result<Vec<Tensor>> {
    if fresh.len() != stored.len() {
        return Err(MeshError::StructureMismatch(format!(
            "{}: expected {} leaves, checkpoint has {}",
            what,
            fresh.len(),
            stored.len()
        ))
        .into());
    }
    fresh
        .iter()
        .zip(stored)
        .enumerate()
        .map(|(i, (f, s))| -> Result<Tensor> {
            if f.dims() != s.dims() {
                return Err(MeshError::StructureMismatch(format!(
                    "{} leaf {}: expected shape {:?}, checkpoint has {:?}",
                    what,
                    i,
                    f.dims(),
                    s.dims()
                ))
                .into());
            }
            Ok(s.to_dtype(f.dtype())?.to_device(f.device())?)
        })
        .collect()
}
