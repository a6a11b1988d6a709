//! One optimizer step
//!
//! `(params, opt_state) -> (params', opt_state', loss)`. The previous
//! state is moved in and never handed back, so a caller cannot keep using
//! parameters that the step has superseded.

use anyhow::{Context, Result};
use candle_core::DType;
use meshgpt_core::{shard_params, DeviceMesh, LanguageModel, ParamTree, Policy, RngKey};
use meshgpt_optimizer::{apply_updates, OptState, ScheduledAdamW};

use crate::accumulate::accumulate_gradients;
use crate::batch::Batch;

/// Storage-precision parameters and the optimizer state that goes with
/// them.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub params: ParamTree,
    pub opt_state: OptState,
}

impl TrainState {
    pub fn step(&self) -> usize {
        self.opt_state.count
    }
}

#[derive(Debug)]
pub struct StepOutcome {
    pub state: TrainState,
    /// Mean loss over the step's `G x B` sequences.
    pub loss: f32,
    pub lr: f64,
    pub grad_norm: f64,
}

pub struct TrainStep<'a, M: LanguageModel> {
    model: &'a M,
    mesh: &'a DeviceMesh,
    optimizer: &'a ScheduledAdamW,
    policy: Policy,
    shard_model: bool,
}

impl<'a, M: LanguageModel> TrainStep<'a, M> {
    pub fn new(
        model: &'a M,
        mesh: &'a DeviceMesh,
        optimizer: &'a ScheduledAdamW,
        policy: Policy,
        shard_model: bool,
    ) -> Self {
        Self {
            model,
            mesh,
            optimizer,
            policy,
            shard_model,
        }
    }

    pub fn run(&self, state: TrainState, batch: &Batch, key: RngKey) -> Result<StepOutcome> {
        self.policy.ensure_supported(self.mesh.devices())?;
        let TrainState { params, opt_state } = state;

        let compute = self.policy.cast_to_compute(&params)?;
        let out = accumulate_gradients(self.model, &compute, batch, key, self.mesh)
            .context("gradient accumulation")?;

        let grads = shard_params(&self.policy.cast_to_param(&out.grads)?, self.mesh, self.shard_model)?;
        let (updates, opt_state, stats) = self.optimizer.update(&grads, opt_state, &params)?;
        let params = shard_params(&apply_updates(&params, &updates)?, self.mesh, self.shard_model)?;

        let loss = self
            .policy
            .cast_to_output(&out.loss)?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;

        Ok(StepOutcome {
            state: TrainState { params, opt_state },
            loss,
            lr: stats.lr,
            grad_norm: stats.grad_norm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::sample_batch;
    use candle_core::Device;
    use meshgpt_core::{Gpt, GptConfig, Placement};
    use meshgpt_optimizer::AdamWConfig;

    #[test]
    fn test_step_updates_and_keeps_placement() -> Result<()> {
        let model = Gpt::new(GptConfig::tiny())?;
        let mesh = DeviceMesh::cpu(2)?;
        let optimizer = ScheduledAdamW::new(AdamWConfig {
            warmup_steps: 0,
            ..AdamWConfig::default()
        });
        let params = shard_params(&model.init(RngKey::new(0), DType::F32, &Device::Cpu)?, &mesh, true)?;
        let state = TrainState {
            opt_state: optimizer.init(&params)?,
            params: params.clone(),
        };
        let data: Vec<u16> = (0..300).map(|i| (i * 3 % 16) as u16).collect();
        let batch = sample_batch(&data, 8, 4, Some(2), RngKey::new(1), &Device::Cpu)?;

        let step = TrainStep::new(&model, &mesh, &optimizer, Policy::default(), true);
        let out = step.run(state, &batch, RngKey::new(2))?;

        assert_eq!(out.state.step(), 1);
        assert!(out.loss.is_finite() && out.loss > 0.0);
        assert!(out.grad_norm > 0.0);
        out.state.params.ensure_same_structure(&params)?;
        assert_eq!(
            out.state.params.get("h.0.mlp.c_fc.weight")?.placement,
            Some(Placement::Sharded { axis: 1 })
        );
        let moved = (out.state.params.tensor("wte")? - params.tensor("wte")?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(moved > 0.0);
        Ok(())
    }

    #[test]
    fn test_half_compute_keeps_storage_precision() -> Result<()> {
        let model = Gpt::new(GptConfig::tiny())?;
        let mesh = DeviceMesh::cpu(1)?;
        let optimizer = ScheduledAdamW::new(AdamWConfig::default());
        let policy = Policy::new(DType::F32, DType::F16);
        let params = shard_params(&model.init(RngKey::new(0), DType::F32, &Device::Cpu)?, &mesh, false)?;
        let data: Vec<u16> = (0..300).map(|i| (i * 3 % 16) as u16).collect();
        let batch = sample_batch(&data, 8, 4, Some(2), RngKey::new(1), &Device::Cpu)?;

        let compute = policy.cast_to_compute(&params)?;
        let out = accumulate_gradients(&model, &compute, &batch, RngKey::new(2), &mesh)?;
        assert_eq!(out.loss.dtype(), DType::F16);
        assert!(out.grads.values().iter().all(|g| g.dtype() == DType::F16));
        let grads = policy.cast_to_param(&out.grads)?;
        assert!(grads.values().iter().all(|g| g.dtype() == DType::F32));

        let state = TrainState {
            opt_state: optimizer.init(&params)?,
            params,
        };
        let step = TrainStep::new(&model, &mesh, &optimizer, policy, false);
        let out = step.run(state, &batch, RngKey::new(2))?;
        assert!(out.loss.is_finite() && out.loss > 0.0);
        assert!(out.state.params.values().iter().all(|p| p.dtype() == DType::F32));
        assert!(out
            .state
            .opt_state
            .mu
            .values()
            .iter()
            .chain(out.state.opt_state.nu.values().iter())
            .all(|m| m.dtype() == DType::F32));
        Ok(())
    }

    #[test]
    fn test_bf16_compute_on_cpu_is_a_configuration_error() -> Result<()> {
        let model = Gpt::new(GptConfig::tiny())?;
        let mesh = DeviceMesh::cpu(1)?;
        let optimizer = ScheduledAdamW::new(AdamWConfig::default());
        let params = shard_params(&model.init(RngKey::new(0), DType::F32, &Device::Cpu)?, &mesh, false)?;
        let data: Vec<u16> = (0..300).map(|i| (i * 3 % 16) as u16).collect();
        let batch = sample_batch(&data, 8, 4, Some(1), RngKey::new(1), &Device::Cpu)?;
        let state = TrainState {
            opt_state: optimizer.init(&params)?,
            params,
        };

        let step = TrainStep::new(&model, &mesh, &optimizer, Policy::new(DType::F32, DType::BF16), false);
        let err = step.run(state, &batch, RngKey::new(2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<meshgpt_core::MeshError>(),
            Some(meshgpt_core::MeshError::Config(_))
        ));
        Ok(())
    }
}
