//! Batch sampling
//!
//! Windows of `block_size + 1` consecutive tokens are drawn at uniformly
//! random offsets; the input is the first `block_size` tokens and the
//! target the last `block_size`.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use meshgpt_core::RngKey;
use rand::Rng;

/// Token ids as `u32`, shaped `(G, B, T)` for training or `(B, T)` for
/// evaluation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Tensor,
    pub y: Tensor,
}

impl Batch {
    /// `G`, or 1 for a flat batch.
    pub fn num_microbatches(&self) -> usize {
        match self.x.dims() {
            [g, _, _] => *g,
            _ => 1,
        }
    }

    /// Inputs and targets of microbatch `g`, each `(B, T)`.
    pub fn microbatch(&self, g: usize) -> Result<(Tensor, Tensor)> {
        if self.x.rank() == 2 {
            if g != 0 {
                bail!("flat batch has no microbatch {}", g);
            }
            return Ok((self.x.clone(), self.y.clone()));
        }
        Ok((self.x.get(g)?, self.y.get(g)?))
    }
}

pub fn sample_batch(
    data: &[u16],
    block_size: usize,
    batch_size: usize,
    g_accum_iters: Option<usize>,
    key: RngKey,
    device: &Device,
) -> Result<Batch> {
    if data.len() <= block_size {
        bail!(
            "dataset of {} tokens is too short for block_size {}",
            data.len(),
            block_size
        );
    }
    let rows = batch_size * g_accum_iters.unwrap_or(1);
    let mut rng = key.rng();

    let mut x = Vec::with_capacity(rows * block_size);
    let mut y = Vec::with_capacity(rows * block_size);
    for _ in 0..rows {
        let start = rng.gen_range(0..data.len() - block_size);
        x.extend(data[start..start + block_size].iter().map(|&t| t as u32));
        y.extend(data[start + 1..start + block_size + 1].iter().map(|&t| t as u32));
    }

    let (x, y) = match g_accum_iters {
        Some(g) => (
            Tensor::from_vec(x, (g, batch_size, block_size), device)?,
            Tensor::from_vec(y, (g, batch_size, block_size), device)?,
        ),
        None => (
            Tensor::from_vec(x, (batch_size, block_size), device)?,
            Tensor::from_vec(y, (batch_size, block_size), device)?,
        ),
    };
    Ok(Batch { x, y })
}
