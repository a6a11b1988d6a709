//! Mixed-precision policy
//!
//! Parameters, optimizer moments and checkpoints live in `param_dtype`.
//! Forward/backward runs on a `compute_dtype` copy, and scalar outputs such
//! as the loss are handed back in `output_dtype`.

use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::error::{MeshError, Result};
use crate::tree::ParamTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub param_dtype: DType,
    pub compute_dtype: DType,
    pub output_dtype: DType,
}

impl Default for Policy {
    fn default() -> Self {
        Self::uniform(DType::F32)
    }
}

impl Policy {
    pub fn new(param_dtype: DType, compute_dtype: DType) -> Self {
        Self {
            param_dtype,
            compute_dtype,
            output_dtype: compute_dtype,
        }
    }

    pub fn uniform(dtype: DType) -> Self {
        Self {
            param_dtype: dtype,
            compute_dtype: dtype,
            output_dtype: dtype,
        }
    }

    /// Parse `"params=float32,compute=bfloat16,output=bfloat16"` or a single
    /// dtype name applied everywhere. Unspecified `output` follows `compute`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if !text.contains('=') {
            return Ok(Self::uniform(parse_dtype(text)?));
        }

        let mut params = None;
        let mut compute = None;
        let mut output = None;
        for part in text.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| MeshError::Config(format!("malformed policy entry `{}`", part)))?;
            let dtype = parse_dtype(value)?;
            match key.trim() {
                "p" | "params" => params = Some(dtype),
                "c" | "compute" => compute = Some(dtype),
                "o" | "output" => output = Some(dtype),
                other => {
                    return Err(MeshError::Config(format!("unknown policy key `{}`", other)))
                }
            }
        }

        let param_dtype = params.unwrap_or(DType::F32);
        let compute_dtype = compute.unwrap_or(param_dtype);
        Ok(Self {
            param_dtype,
            compute_dtype,
            output_dtype: output.unwrap_or(compute_dtype),
        })
    }

    /// Reject a compute dtype some device in `devices` has no kernels for.
    /// candle's CPU backend cannot run bf16 matmuls; f16 is fine.
    pub fn ensure_supported(&self, devices: &[Device]) -> Result<()> {
        if self.compute_dtype == DType::BF16 && devices.iter().any(|d| d.is_cpu()) {
            return Err(MeshError::Config(format!(
                "compute dtype {} is not supported on CPU devices, use float16 or float32",
                dtype_name(self.compute_dtype)
            )));
        }
        Ok(())
    }

    pub fn cast_to_compute(&self, tree: &ParamTree) -> Result<ParamTree> {
        cast_tree(tree, self.compute_dtype)
    }

    pub fn cast_to_param(&self, tree: &ParamTree) -> Result<ParamTree> {
        cast_tree(tree, self.param_dtype)
    }

    pub fn cast_to_output(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_float(tensor, self.output_dtype)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "params={},compute={},output={}",
            dtype_name(self.param_dtype),
            dtype_name(self.compute_dtype),
            dtype_name(self.output_dtype)
        )
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.trim().to_lowercase().as_str() {
        "f32" | "float32" | "full" => Ok(DType::F32),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f16" | "float16" | "half" => Ok(DType::F16),
        other => Err(MeshError::UnknownDType(other.to_string())),
    }
}

pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float32",
        DType::BF16 => "bfloat16",
        DType::F16 => "float16",
        DType::F64 => "float64",
        _ => "integer",
    }
}

/// Integer leaves are left untouched.
fn cast_float(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype().is_float() && tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor.clone())
    }
}

fn cast_tree(tree: &ParamTree, dtype: DType) -> Result<ParamTree> {
    // Casting does not move data, so placement survives.
    tree.map(|_, p| {
        let mut cast = p.with_value(cast_float(&p.value, dtype)?);
        cast.placement = p.placement;
        Ok(cast)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Node, ParamKind};
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_parse_policies() -> Result<()> {
        let p = Policy::parse("params=float32,compute=bfloat16,output=bfloat16")?;
        assert_eq!(p.param_dtype, DType::F32);
        assert_eq!(p.compute_dtype, DType::BF16);
        assert_eq!(p.output_dtype, DType::BF16);

        let p = Policy::parse("p=f32,c=f16")?;
        assert_eq!(p.output_dtype, DType::F16);

        assert_eq!(Policy::parse("float32")?, Policy::uniform(DType::F32));
        assert!(Policy::parse("params=float8").is_err());
        assert!(Policy::parse("weights=float32").is_err());
        Ok(())
    }

    #[test]
    fn test_display_round_trips() -> Result<()> {
        let p = Policy::new(DType::F32, DType::BF16);
        assert_eq!(Policy::parse(&p.to_string())?, p);
        Ok(())
    }

    #[test]
    fn test_bf16_compute_is_rejected_on_cpu() -> Result<()> {
        let cpu = [Device::Cpu];
        assert!(matches!(
            Policy::new(DType::F32, DType::BF16).ensure_supported(&cpu),
            Err(MeshError::Config(_))
        ));
        Policy::new(DType::F32, DType::F16).ensure_supported(&cpu)?;
        Policy::default().ensure_supported(&cpu)?;
        // bf16 storage is only ever cast, never multiplied
        Policy::new(DType::BF16, DType::F32).ensure_supported(&cpu)?;
        Ok(())
    }

    #[test]
    fn test_cast_round_trip_within_rounding() -> Result<()> {
        let dev = Device::Cpu;
        let values = Tensor::new(&[0.1f32, -2.5, 3.0, 1e-3], &dev)?;
        let tree = ParamTree::new(vec![(
            "w".to_string(),
            Node::leaf(ParamKind::NormScale, values.clone()),
        )])?;
        let policy = Policy::new(DType::F32, DType::BF16);

        let compute = policy.cast_to_compute(&tree)?;
        assert_eq!(compute.tensor("w")?.dtype(), DType::BF16);
        let back = policy.cast_to_param(&compute)?;
        assert_eq!(back.tensor("w")?.dtype(), DType::F32);

        let diff = (back.tensor("w")? - &values)?.abs()?.max(0)?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-2);
        Ok(())
    }
}
