//! Scheduled AdamW over parameter trees
//!
//! One update is the fixed chain
//! clip-by-global-norm → Adam moments → decoupled weight decay →
//! schedule scaling → sign flip, applied leaf by leaf. The transformation
//! is pure: it takes the optimizer state by value and hands back the next
//! one, never touching the parameters themselves.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use meshgpt_core::{MeshError, Param, ParamTree};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::schedule::WarmupCosine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub peak_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub lr_decay_steps: usize,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Gradients are rescaled so their global L2 norm is at most this.
    pub max_grad_norm: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            peak_lr: 1e-3,
            min_lr: 1e-4,
            warmup_steps: 100,
            lr_decay_steps: 5000,
            beta1: 0.9,
            beta2: 0.99,
            eps: 1e-8,
            weight_decay: 0.1,
            max_grad_norm: 1.0,
        }
    }
}

impl AdamWConfig {
    pub fn schedule(&self) -> WarmupCosine {
        WarmupCosine::new(self.peak_lr, self.min_lr, self.warmup_steps, self.lr_decay_steps)
    }
}

/// Moments mirror the parameter tree; `count` is the number of updates
/// applied so far.
#[derive(Debug, Clone)]
pub struct OptState {
    pub count: usize,
    pub mu: ParamTree,
    pub nu: ParamTree,
}

impl OptState {
    pub fn init(params: &ParamTree) -> Result<Self> {
        let zeros = params.map(|_, p| Ok(placed_like(p, p.value.zeros_like()?)))?;
        Ok(Self {
            count: 0,
            mu: zeros.clone(),
            nu: zeros,
        })
    }

    /// Flat leaf sequence: the counter as an `i64` scalar, then every first
    /// moment, then every second moment.
    pub fn leaves(&self, device: &Device) -> Result<Vec<Tensor>> {
        let count = Tensor::new(self.count as i64, device)?;
        let mut leaves = Vec::with_capacity(self.num_leaves());
        leaves.push(count);
        leaves.extend(self.mu.values());
        leaves.extend(self.nu.values());
        Ok(leaves)
    }

    pub fn num_leaves(&self) -> usize {
        1 + self.mu.num_leaves() + self.nu.num_leaves()
    }

    /// Attach a flat leaf sequence produced by [`OptState::leaves`] to this
    /// state's structure.
    pub fn with_values(&self, values: Vec<Tensor>) -> Result<Self> {
        if values.len() != self.num_leaves() {
            return Err(MeshError::StructureMismatch(format!(
                "optimizer state has {} leaves, found {}",
                self.num_leaves(),
                values.len()
            ))
            .into());
        }
        let mut values = values.into_iter();
        let count = values
            .next()
            .context("missing step counter")?
            .to_dtype(DType::I64)?
            .to_scalar::<i64>()?;
        let count = usize::try_from(count)
            .map_err(|_| MeshError::StructureMismatch(format!("negative step counter {}", count)))?;

        let n = self.mu.num_leaves();
        let mu_values: Vec<Tensor> = values.by_ref().take(n).collect();
        let nu_values: Vec<Tensor> = values.collect();
        Ok(Self {
            count,
            mu: keep_placement(&self.mu, &self.mu.with_values(mu_values)?)?,
            nu: keep_placement(&self.nu, &self.nu.with_values(nu_values)?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UpdateStats {
    /// Learning rate the update was scaled by.
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

pub struct ScheduledAdamW {
    config: AdamWConfig,
    schedule: WarmupCosine,
}

impl ScheduledAdamW {
    pub fn new(config: AdamWConfig) -> Self {
        let schedule = config.schedule();
        Self { config, schedule }
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn schedule(&self) -> &WarmupCosine {
        &self.schedule
    }

    /// Learning rate of the update applied when the counter reads `count`.
    pub fn lr_at(&self, count: usize) -> f64 {
        self.schedule.value(count)
    }

    pub fn init(&self, params: &ParamTree) -> Result<OptState> {
        OptState::init(params)
    }

    /// Compute updates for `grads`. The returned tree is meant for
    /// [`apply_updates`].
    pub fn update(
        &self,
        grads: &ParamTree,
        state: OptState,
        params: &ParamTree,
    ) -> Result<(ParamTree, OptState, UpdateStats)> {
        params.ensure_same_structure(grads).context("gradient tree")?;
        params.ensure_same_structure(&state.mu).context("first moments")?;
        params.ensure_same_structure(&state.nu).context("second moments")?;

        let cfg = &self.config;
        let grad_norm = global_norm(grads)?;
        // NaN norms fall through to the division and poison the update.
        let clip = if grad_norm < cfg.max_grad_norm {
            1.0
        } else {
            cfg.max_grad_norm / grad_norm
        };
        if clip < 1.0 {
            debug!("clipping gradient norm {:.4} to {}", grad_norm, cfg.max_grad_norm);
        }

        let mu = grads.zip_map(&state.mu, |_, g, m| {
            let value = ((&m.value * cfg.beta1)? + (&g.value * (clip * (1.0 - cfg.beta1)))?)?;
            Ok(placed_like(m, value))
        })?;
        let nu = grads.zip_map(&state.nu, |_, g, v| {
            let g = (&g.value * clip)?;
            let value = ((&v.value * cfg.beta2)? + (g.sqr()? * (1.0 - cfg.beta2))?)?;
            Ok(placed_like(v, value))
        })?;

        let count = state.count + 1;
        let bias1 = 1.0 - cfg.beta1.powi(count as i32);
        let bias2 = 1.0 - cfg.beta2.powi(count as i32);
        let lr = self.schedule.value(state.count);

        let adam = mu.zip_map(&nu, |_, m, v| {
            let m_hat = (&m.value / bias1)?;
            let v_hat = (&v.value / bias2)?;
            Ok(m.with_value((m_hat / (v_hat.sqrt()? + cfg.eps)?)?))
        })?;
        let updates = adam.zip_map(params, |_, u, p| {
            let decayed = (&u.value + (&p.value * cfg.weight_decay)?)?;
            Ok(placed_like(p, (decayed * -lr)?))
        })?;

        Ok((updates, OptState { count, mu, nu }, UpdateStats { lr, grad_norm }))
    }
}

/// `params + updates`, leaf by leaf, keeping placements.
pub fn apply_updates(params: &ParamTree, updates: &ParamTree) -> Result<ParamTree> {
    Ok(params.zip_map(updates, |_, p, u| {
        let value = (&p.value + u.value.to_dtype(p.value.dtype())?)?;
        Ok(placed_like(p, value))
    })?)
}

/// L2 norm over every leaf, accumulated in f32.
pub fn global_norm(tree: &ParamTree) -> Result<f64> {
    let mut total = 0f64;
    for (_, p) in tree.leaves() {
        let sq = p.value.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
        total += sq as f64;
    }
    Ok(total.sqrt())
}

fn placed_like(template: &Param, value: Tensor) -> Param {
    let mut param = template.with_value(value);
    param.placement = template.placement;
    param
}

fn keep_placement(template: &ParamTree, tree: &ParamTree) -> Result<ParamTree> {
    Ok(template.zip_map(tree, |_, t, p| Ok(placed_like(t, p.value.clone())))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use meshgpt_core::{Node, ParamKind};

    fn tree(w: &[f32], b: &[f32]) -> ParamTree {
        let dev = Device::Cpu;
        ParamTree::new(vec![
            ("w".to_string(), Node::leaf(ParamKind::LinearWeight, Tensor::new(w, &dev).unwrap())),
            ("b".to_string(), Node::leaf(ParamKind::Bias, Tensor::new(b, &dev).unwrap())),
        ])
        .unwrap()
    }

    fn values(tree: &ParamTree, path: &str) -> Vec<f32> {
        tree.tensor(path).unwrap().to_vec1::<f32>().unwrap()
    }

    fn optimizer(warmup_steps: usize) -> ScheduledAdamW {
        ScheduledAdamW::new(AdamWConfig {
            peak_lr: 0.1,
            min_lr: 0.01,
            warmup_steps,
            lr_decay_steps: 10,
            weight_decay: 0.0,
            ..AdamWConfig::default()
        })
    }

    #[test]
    fn test_first_step_has_zero_lr() -> Result<()> {
        let opt = optimizer(5);
        let params = tree(&[1.0, -2.0], &[0.5]);
        let grads = tree(&[0.1, 0.2], &[-0.3]);
        let state = opt.init(&params)?;

        let (updates, state, stats) = opt.update(&grads, state, &params)?;
        assert_eq!(stats.lr, 0.0);
        assert_eq!(state.count, 1);
        let next = apply_updates(&params, &updates)?;
        assert_eq!(values(&next, "w"), vec![1.0, -2.0]);
        // moments still move
        assert!(values(&state.mu, "w")[0] > 0.0);
        Ok(())
    }

    #[test]
    fn test_bias_corrected_step_is_sign_of_gradient() -> Result<()> {
        let opt = optimizer(0);
        let params = tree(&[1.0, -2.0], &[0.5]);
        let grads = tree(&[0.01, -0.02], &[0.03]);
        let (updates, _, stats) = opt.update(&grads, opt.init(&params)?, &params)?;

        assert_relative_eq!(stats.lr, 0.1);
        let u = values(&updates, "w");
        assert_relative_eq!(u[0], -0.1, epsilon = 1e-5);
        assert_relative_eq!(u[1], 0.1, epsilon = 1e-5);
        assert_relative_eq!(values(&updates, "b")[0], -0.1, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_weight_decay_is_decoupled() -> Result<()> {
        let opt = ScheduledAdamW::new(AdamWConfig {
            peak_lr: 0.1,
            warmup_steps: 0,
            weight_decay: 0.5,
            ..AdamWConfig::default()
        });
        let params = tree(&[2.0], &[0.0]);
        let grads = tree(&[0.0], &[0.0]);
        let (updates, _, _) = opt.update(&grads, opt.init(&params)?, &params)?;
        assert_relative_eq!(values(&updates, "w")[0], -0.1, epsilon = 1e-6);
        assert_eq!(values(&updates, "b")[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_clipping_bounds_the_moments() -> Result<()> {
        let opt = optimizer(0);
        let params = tree(&[0.0, 0.0], &[0.0]);
        let grads = tree(&[30.0, 40.0], &[0.0]);
        let (_, state, stats) = opt.update(&grads, opt.init(&params)?, &params)?;

        assert_relative_eq!(stats.grad_norm, 50.0, epsilon = 1e-4);
        // mu = (1 - beta1) * g * (1 / 50)
        let mu = values(&state.mu, "w");
        assert_relative_eq!(mu[0], 0.1 * 0.6, epsilon = 1e-6);
        assert_relative_eq!(mu[1], 0.1 * 0.8, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_nan_gradients_propagate() -> Result<()> {
        let opt = optimizer(0);
        let params = tree(&[1.0], &[1.0]);
        let grads = tree(&[f32::NAN], &[0.0]);
        let (updates, _, stats) = opt.update(&grads, opt.init(&params)?, &params)?;
        assert!(stats.grad_norm.is_nan());
        assert!(values(&apply_updates(&params, &updates)?, "w")[0].is_nan());
        Ok(())
    }

    #[test]
    fn test_structure_mismatch_is_rejected() -> Result<()> {
        let opt = optimizer(0);
        let params = tree(&[1.0, 2.0], &[0.0]);
        let grads = tree(&[1.0], &[0.0]);
        let err = opt.update(&grads, opt.init(&params)?, &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MeshError>(),
            Some(MeshError::StructureMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_state_leaves_round_trip() -> Result<()> {
        let opt = optimizer(0);
        let params = tree(&[1.0, 2.0], &[0.5]);
        let grads = tree(&[0.1, -0.1], &[0.2]);
        let (_, state, _) = opt.update(&grads, opt.init(&params)?, &params)?;

        let leaves = state.leaves(&Device::Cpu)?;
        assert_eq!(leaves.len(), 5);
        assert_eq!(leaves[0].dtype(), DType::I64);

        let fresh = opt.init(&params)?;
        let restored = fresh.with_values(leaves)?;
        assert_eq!(restored.count, 1);
        assert_eq!(values(&restored.nu, "w"), values(&state.nu, "w"));

        assert!(fresh.with_values(vec![]).is_err());
        Ok(())
    }
}
