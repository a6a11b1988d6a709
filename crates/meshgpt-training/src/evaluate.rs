//! Held-out loss estimation

use anyhow::Result;
use candle_core::{DType, Tensor};
use meshgpt_core::{DeviceMesh, LanguageModel, ParamTree, Policy, RngKey};

use crate::accumulate::loss_fn;
use crate::batch::sample_batch;

/// Number of batches averaged per evaluation.
pub const EVAL_ITERS: usize = 200;

pub struct Evaluator<'a, M: LanguageModel> {
    model: &'a M,
    mesh: &'a DeviceMesh,
    policy: Policy,
    batch_size: usize,
    iters: usize,
}

impl<'a, M: LanguageModel> Evaluator<'a, M> {
    pub fn new(model: &'a M, mesh: &'a DeviceMesh, policy: Policy, batch_size: usize) -> Self {
        Self {
            model,
            mesh,
            policy,
            batch_size,
            iters: EVAL_ITERS,
        }
    }

    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    /// Mean loss over `iters` random batches, forward only with dropout off.
    /// `key` only drives batch sampling.
    pub fn evaluate(&self, params: &ParamTree, data: &[u16], key: RngKey) -> Result<f32> {
        let compute = self.policy.cast_to_compute(params)?;
        let replicas = self.mesh.gather_replicas(&compute)?;
        let block_size = self.model.config().block_size;
        let primary = self.mesh.primary();

        let mut total = Tensor::zeros((), DType::F32, primary)?;
        for batch_key in key.split_n(self.iters) {
            let batch = sample_batch(data, block_size, self.batch_size, None, batch_key, primary)?;
            let xs = self.mesh.split_rows(&batch.x)?;
            let ys = self.mesh.split_rows(&batch.y)?;
            for (rank, replica) in replicas.iter().enumerate() {
                let loss = loss_fn(self.model, replica, &xs[rank], &ys[rank], None)?;
                total = total.add(&(loss / self.mesh.size() as f64)?.to_device(primary)?)?;
            }
        }
        Ok((total / self.iters as f64)?.to_scalar::<f32>()?)
    }
}
