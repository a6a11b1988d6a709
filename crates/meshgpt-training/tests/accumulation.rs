use anyhow::Result;
use approx::assert_abs_diff_eq;
use candle_core::{DType, Device};
use meshgpt_core::{shard_params, DeviceMesh, Gpt, GptConfig, LanguageModel, ParamTree, RngKey};
use meshgpt_training::{accumulate_gradients, sample_batch, Batch};

fn corpus() -> Vec<u16> {
    (0..400u32).map(|i| ((i * 7 + i / 3) % 16) as u16).collect()
}

fn max_abs_diff(a: &ParamTree, b: &ParamTree) -> Result<f32> {
    let mut worst = 0f32;
    for ((_, x), (_, y)) in a.leaves().iter().zip(b.leaves().iter()) {
        let d = (&x.value - &y.value)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        worst = worst.max(d);
    }
    Ok(worst)
}

/// `(1, B, T)` -> `(g, B / g, T)`, same rows in the same order.
fn regroup(batch: &Batch, g: usize) -> Result<Batch> {
    let (_, rows, t) = batch.x.dims3()?;
    Ok(Batch {
        x: batch.x.reshape((g, rows / g, t))?,
        y: batch.y.reshape((g, rows / g, t))?,
    })
}

#[test]
fn microbatched_batch_has_expected_shapes() -> Result<()> {
    let model = Gpt::new(GptConfig::tiny())?;
    let params = model.init(RngKey::new(0), DType::F32, &Device::Cpu)?;
    let mesh = DeviceMesh::cpu(1)?;

    let batch = sample_batch(&corpus(), 8, 4, Some(2), RngKey::new(1), &Device::Cpu)?;
    assert_eq!(batch.x.dims(), &[2, 4, 8]);

    let out = accumulate_gradients(&model, &params, &batch, RngKey::new(2), &mesh)?;
    for ((path, p), (_, g)) in params.leaves().iter().zip(out.grads.leaves().iter()) {
        assert_eq!(p.shape(), g.shape(), "gradient shape of {}", path);
    }
    assert_eq!(out.loss.rank(), 0);
    assert!(out.loss.to_scalar::<f32>()? >= 0.0);
    Ok(())
}

#[test]
fn accumulation_matches_one_large_batch() -> Result<()> {
    let model = Gpt::new(GptConfig::tiny())?;
    let params = model.init(RngKey::new(0), DType::F32, &Device::Cpu)?;
    let mesh = DeviceMesh::cpu(1)?;

    let whole = sample_batch(&corpus(), 8, 8, Some(1), RngKey::new(3), &Device::Cpu)?;
    let reference = accumulate_gradients(&model, &params, &whole, RngKey::new(4), &mesh)?;

    for g in [2, 4, 8] {
        let split = regroup(&whole, g)?;
        assert_eq!(split.num_microbatches(), g);
        let out = accumulate_gradients(&model, &params, &split, RngKey::new(4), &mesh)?;
        assert_abs_diff_eq!(max_abs_diff(&reference.grads, &out.grads)?, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(
            reference.loss.to_scalar::<f32>()?,
            out.loss.to_scalar::<f32>()?,
            epsilon = 1e-5
        );
    }
    Ok(())
}

#[test]
fn mesh_size_does_not_change_the_gradient() -> Result<()> {
    // dropout on: per-row keys keep masks identical however rows are split
    let model = Gpt::new(GptConfig::tiny().with_dropout(0.2))?;
    let params = model.init(RngKey::new(0), DType::F32, &Device::Cpu)?;
    let batch = sample_batch(&corpus(), 8, 4, Some(2), RngKey::new(5), &Device::Cpu)?;

    let one = accumulate_gradients(&model, &params, &batch, RngKey::new(6), &DeviceMesh::cpu(1)?)?;
    let two = accumulate_gradients(&model, &params, &batch, RngKey::new(6), &DeviceMesh::cpu(2)?)?;
    assert_abs_diff_eq!(max_abs_diff(&one.grads, &two.grads)?, 0.0, epsilon = 1e-5);

    let odd = accumulate_gradients(&model, &params, &batch, RngKey::new(6), &DeviceMesh::cpu(3)?);
    assert!(odd.is_err());
    Ok(())
}

#[test]
fn sharded_parameters_give_the_replicated_gradient() -> Result<()> {
    let model = Gpt::new(GptConfig::tiny())?;
    let params = model.init(RngKey::new(0), DType::F32, &Device::Cpu)?;
    let mesh = DeviceMesh::cpu(2)?;
    let sharded = shard_params(&params, &mesh, true)?;

    // between steps each rank only keeps its slice
    let slices = mesh.scatter(&sharded)?;
    for local in &slices {
        assert_eq!(local.num_bytes(), mesh.bytes_per_device(&sharded));
        assert!(local.num_bytes() < params.num_bytes());
    }
    assert_eq!(slices[1].get("wte")?.shape()[1] * 2, params.get("wte")?.shape()[1]);

    let batch = sample_batch(&corpus(), 8, 4, Some(2), RngKey::new(7), &Device::Cpu)?;
    let reference = accumulate_gradients(&model, &params, &batch, RngKey::new(8), &DeviceMesh::cpu(1)?)?;
    let out = accumulate_gradients(&model, &sharded, &batch, RngKey::new(8), &mesh)?;
    assert_abs_diff_eq!(max_abs_diff(&reference.grads, &out.grads)?, 0.0, epsilon = 1e-5);
    Ok(())
}
