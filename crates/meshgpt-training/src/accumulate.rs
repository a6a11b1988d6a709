//! Gradient accumulation across microbatches and mesh ranks
//!
//! Microbatches run strictly one after another. Inside a microbatch the
//! rows are split evenly across the mesh. Every rank rebuilds a working
//! copy of the compute parameters from the ranks' slices (an all-gather of
//! whatever the placements shard), differentiates its share of the loss
//! against it, and the per-rank gradients are summed on the primary device.
//! Sums are kept in f32 and divided by `G` at the end. The working copies
//! are dropped when the call returns.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::loss::cross_entropy;
use meshgpt_core::{DeviceMesh, LanguageModel, ParamTree, RngKey};

use crate::batch::Batch;

pub struct LossAndGrads {
    /// Mean loss over all `G x B` rows, scalar in the compute dtype.
    pub loss: Tensor,
    /// Same structure as the compute parameters, compute dtype, no placement.
    pub grads: ParamTree,
}

/// Mean next-token cross entropy, computed in f32 whatever the logits dtype.
pub fn loss_fn<M: LanguageModel>(
    model: &M,
    params: &ParamTree,
    x: &Tensor,
    y: &Tensor,
    keys: Option<&[RngKey]>,
) -> Result<Tensor> {
    let logits = model.forward(params, x, keys)?;
    let (b, t, v) = logits.dims3()?;
    let logits = logits.to_dtype(DType::F32)?.reshape((b * t, v))?;
    Ok(cross_entropy(&logits, &y.flatten_all()?)?)
}

/// Differentiable working copy of the parameters on one rank.
struct Replica {
    vars: Vec<Var>,
    params: ParamTree,
}

impl Replica {
    fn from_gathered(local: ParamTree) -> Result<Self> {
        let vars = local
            .values()
            .iter()
            .map(Var::from_tensor)
            .collect::<candle_core::Result<Vec<_>>>()?;
        let params = local.with_values(vars.iter().map(|v| v.as_tensor().clone()).collect())?;
        Ok(Self { vars, params })
    }
}

pub fn accumulate_gradients<M: LanguageModel>(
    model: &M,
    params: &ParamTree,
    batch: &Batch,
    key: RngKey,
    mesh: &DeviceMesh,
) -> Result<LossAndGrads> {
    let g_iters = batch.num_microbatches();
    let ranks = mesh.size();
    let primary = mesh.primary();
    let compute_dtype = params
        .values()
        .first()
        .map(|t| t.dtype())
        .context("empty parameter tree")?;

    let replicas = mesh
        .gather_replicas(params)?
        .into_iter()
        .map(Replica::from_gathered)
        .collect::<Result<Vec<_>>>()?;

    let mut loss_sum = Tensor::zeros((), DType::F32, primary)?;
    let mut grad_sum = params
        .values()
        .iter()
        .map(|t| Tensor::zeros(t.dims(), DType::F32, primary))
        .collect::<candle_core::Result<Vec<_>>>()?;

    for (g, micro_key) in key.split_n(g_iters).into_iter().enumerate() {
        let (x, y) = batch.microbatch(g)?;
        let row_keys = micro_key.split_n(x.dim(0)?);
        let xs = mesh.split_rows(&x)?;
        let ys = mesh.split_rows(&y)?;
        let rows_per_rank = row_keys.len() / ranks;

        for (rank, replica) in replicas.iter().enumerate() {
            let keys = &row_keys[rank * rows_per_rank..(rank + 1) * rows_per_rank];
            // Equal shards, so the mean of rank means is the microbatch mean.
            let loss = (loss_fn(model, &replica.params, &xs[rank], &ys[rank], Some(keys))?
                / ranks as f64)?;
            let grads = loss
                .backward()
                .with_context(|| format!("backward pass, microbatch {} rank {}", g, rank))?;

            for (sum, var) in grad_sum.iter_mut().zip(replica.vars.iter()) {
                // Leaves the loss does not depend on get no entry.
                if let Some(grad) = grads.get(var.as_tensor()) {
                    *sum = sum.add(&grad.to_dtype(DType::F32)?.to_device(primary)?)?;
                }
            }
            loss_sum = loss_sum.add(&loss.detach().to_device(primary)?)?;
        }
        tracing::trace!("microbatch {}/{} done", g + 1, g_iters);
    }

    let scale = 1.0 / g_iters as f64;
    let loss = (loss_sum * scale)?.to_dtype(compute_dtype)?;
    let grads = grad_sum
        .into_iter()
        .map(|t| (t * scale)?.to_dtype(compute_dtype))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let grads = params.with_values(grads)?;
    Ok(LossAndGrads { loss, grads })
}
