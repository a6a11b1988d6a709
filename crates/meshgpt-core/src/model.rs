//! Model interface and the reference GPT
//!
//! The training engine only sees [`LanguageModel`]: a pure function from a
//! parameter tree and a token batch to logits. Parameters are never stored
//! in the model object, so the same `Gpt` can run on storage-precision
//! weights, a compute-precision copy, or per-device replicas.

use candle_core::{DType, Device, Tensor, D};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::GptConfig;
use crate::error::{MeshError, Result};
use crate::rng::RngKey;
use crate::tree::{Node, ParamKind, ParamTree};

pub trait LanguageModel {
    fn config(&self) -> &GptConfig;

    /// Fresh parameters. Same key, same tree.
    fn init(&self, key: RngKey, dtype: DType, device: &Device) -> Result<ParamTree>;

    /// Logits `(B, T, vocab)` for token ids `(B, T)`.
    ///
    /// `keys` holds one dropout key per batch row; `None` is inference mode
    /// and disables every stochastic layer.
    fn forward(&self, params: &ParamTree, input_ids: &Tensor, keys: Option<&[RngKey]>) -> Result<Tensor>;
}

pub struct Gpt {
    config: GptConfig,
}

impl Gpt {
    pub fn new(config: GptConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn block(&self, params: &ParamTree, layer: usize, x: &Tensor, mask: &Tensor, dropout: &Dropout) -> Result<Tensor> {
        let prefix = format!("h.{}", layer);
        let site = 1 + 3 * layer as u64;

        let normed = self.layer_norm(params, &format!("{}.ln_1", prefix), x)?;
        let attn_out = self.attention(params, &prefix, &normed, mask, dropout, site)?;
        let x = x.add(&attn_out)?;

        let normed = self.layer_norm(params, &format!("{}.ln_2", prefix), &x)?;
        let hidden = self.linear(params, &format!("{}.mlp.c_fc", prefix), &normed)?;
        let hidden = gelu(&hidden)?;
        let mlp_out = self.linear(params, &format!("{}.mlp.c_proj", prefix), &hidden)?;
        let mlp_out = dropout.apply(&mlp_out, site + 2)?;
        Ok(x.add(&mlp_out)?)
    }

    fn attention(
        &self,
        params: &ParamTree,
        prefix: &str,
        x: &Tensor,
        mask: &Tensor,
        dropout: &Dropout,
        site: u64,
    ) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let n_head = self.config.n_head;
        let head_dim = self.config.head_dim();

        let qkv = self.linear(params, &format!("{}.attn.c_attn", prefix), x)?;
        let split_heads = |start: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, start, c)?
                .reshape((b, t, n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(0)?;
        let k = split_heads(c)?;
        let v = split_heads(2 * c)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        // Softmax in f32 whatever the compute dtype.
        let scores = scores.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(x.dtype())?;
        let probs = dropout.apply(&probs, site)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, c))?;
        let out = self.linear(params, &format!("{}.attn.c_proj", prefix), &context)?;
        dropout.apply(&out, site + 1)
    }

    /// `x @ W (+ b)` with `W` stored `(in, out)`.
    fn linear(&self, params: &ParamTree, prefix: &str, x: &Tensor) -> Result<Tensor> {
        let weight = params.tensor(&format!("{}.weight", prefix))?;
        let (fan_in, fan_out) = weight.dims2()?;
        let mut out_dims = x.dims().to_vec();
        let rows = x.elem_count() / fan_in;
        if let Some(last) = out_dims.last_mut() {
            *last = fan_out;
        }
        let y = x.reshape((rows, fan_in))?.matmul(weight)?.reshape(out_dims)?;
        if self.config.bias {
            let bias = params.tensor(&format!("{}.bias", prefix))?;
            Ok(y.broadcast_add(bias)?)
        } else {
            Ok(y)
        }
    }

    fn layer_norm(&self, params: &ParamTree, prefix: &str, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + 1e-5)?.sqrt()?)?.to_dtype(dtype)?;

        let scaled = normed.broadcast_mul(params.tensor(&format!("{}.weight", prefix))?)?;
        if self.config.bias {
            Ok(scaled.broadcast_add(params.tensor(&format!("{}.bias", prefix))?)?)
        } else {
            Ok(scaled)
        }
    }
}

impl LanguageModel for Gpt {
    fn config(&self) -> &GptConfig {
        &self.config
    }

    fn init(&self, key: RngKey, dtype: DType, device: &Device) -> Result<ParamTree> {
        let cfg = &self.config;
        let c = cfg.n_embd;
        let mut init = Init {
            rng: key.rng(),
            dtype,
            device,
            bias: cfg.bias,
        };
        // GPT-2 scales residual projections by the depth.
        let proj_std = 0.02 / (2.0 * cfg.n_layer as f64).sqrt();

        let mut layers = Vec::with_capacity(cfg.n_layer);
        for layer in 0..cfg.n_layer {
            let block = Node::branch(vec![
                ("ln_1".to_string(), init.layer_norm(c)?),
                (
                    "attn".to_string(),
                    Node::branch(vec![
                        ("c_attn".to_string(), init.linear(c, 3 * c, 0.02)?),
                        ("c_proj".to_string(), init.linear(c, c, proj_std)?),
                    ]),
                ),
                ("ln_2".to_string(), init.layer_norm(c)?),
                (
                    "mlp".to_string(),
                    Node::branch(vec![
                        ("c_fc".to_string(), init.linear(c, 4 * c, 0.02)?),
                        ("c_proj".to_string(), init.linear(4 * c, c, proj_std)?),
                    ]),
                ),
            ]);
            layers.push((layer.to_string(), block));
        }

        ParamTree::new(vec![
            (
                "wte".to_string(),
                Node::leaf(ParamKind::Embedding, init.normal((cfg.vocab_size, c), 0.02)?),
            ),
            (
                "wpe".to_string(),
                Node::leaf(ParamKind::Embedding, init.normal((cfg.block_size, c), 0.02)?),
            ),
            ("h".to_string(), Node::branch(layers)),
            ("ln_f".to_string(), init.layer_norm(c)?),
        ])
    }

    fn forward(&self, params: &ParamTree, input_ids: &Tensor, keys: Option<&[RngKey]>) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        if t > self.config.block_size {
            return Err(MeshError::Config(format!(
                "sequence length {} exceeds block size {}",
                t, self.config.block_size
            )));
        }
        if let Some(keys) = keys {
            if keys.len() != b {
                return Err(MeshError::Config(format!(
                    "{} dropout keys for a batch of {} rows",
                    keys.len(),
                    b
                )));
            }
        }
        if b == 0 || t == 0 {
            let wte = params.tensor("wte")?;
            return Ok(Tensor::zeros((b, t, self.config.vocab_size), wte.dtype(), wte.device())?);
        }
        let dropout = Dropout {
            rate: self.config.dropout,
            keys,
        };

        let wte = params.tensor("wte")?;
        let c = self.config.n_embd;
        let tokens = wte
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, t, c))?;
        let positions = params.tensor("wpe")?.narrow(0, 0, t)?;
        let mut x = dropout.apply(&tokens.broadcast_add(&positions)?, 0)?;

        let mask = causal_mask(t, input_ids.device())?;
        for layer in 0..self.config.n_layer {
            x = self.block(params, layer, &x, &mask, &dropout)?;
        }
        let x = self.layer_norm(params, "ln_f", &x)?;

        // Output head shares the token embedding.
        let logits = x.reshape((b * t, c))?.matmul(&wte.t()?)?;
        Ok(logits.reshape((b, t, self.config.vocab_size))?)
    }
}

struct Init<'a, R: Rng> {
    rng: R,
    dtype: DType,
    device: &'a Device,
    bias: bool,
}

impl<R: Rng> Init<'_, R> {
    fn normal(&mut self, shape: (usize, usize), std: f64) -> Result<Tensor> {
        let dist = Normal::new(0.0f32, std as f32)
            .map_err(|e| MeshError::Config(format!("invalid init std {}: {}", std, e)))?;
        let data: Vec<f32> = (0..shape.0 * shape.1)
            .map(|_| dist.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(data, shape, self.device)?.to_dtype(self.dtype)?)
    }

    fn linear(&mut self, fan_in: usize, fan_out: usize, std: f64) -> Result<Node> {
        let mut children = vec![(
            "weight".to_string(),
            Node::leaf(ParamKind::LinearWeight, self.normal((fan_in, fan_out), std)?),
        )];
        if self.bias {
            children.push((
                "bias".to_string(),
                Node::leaf(ParamKind::Bias, Tensor::zeros(fan_out, self.dtype, self.device)?),
            ));
        }
        Ok(Node::branch(children))
    }

    fn layer_norm(&mut self, dim: usize) -> Result<Node> {
        let mut children = vec![(
            "weight".to_string(),
            Node::leaf(ParamKind::NormScale, Tensor::ones(dim, self.dtype, self.device)?),
        )];
        if self.bias {
            children.push((
                "bias".to_string(),
                Node::leaf(ParamKind::Bias, Tensor::zeros(dim, self.dtype, self.device)?),
            ));
        }
        Ok(Node::branch(children))
    }
}

/// Inverted dropout with masks drawn from per-row keys, so a row's mask does
/// not depend on which other rows share its batch.
struct Dropout<'a> {
    rate: f64,
    keys: Option<&'a [RngKey]>,
}

impl Dropout<'_> {
    fn apply(&self, x: &Tensor, site: u64) -> Result<Tensor> {
        let keys = match self.keys {
            Some(keys) if self.rate > 0.0 && !keys.is_empty() => keys,
            _ => return Ok(x.clone()),
        };
        let per_row = x.elem_count() / keys.len();
        let keep = (1.0 / (1.0 - self.rate)) as f32;

        let mut mask = Vec::with_capacity(x.elem_count());
        for key in keys {
            let mut rng = key.fold_in(site).rng();
            mask.extend((0..per_row).map(|_| if rng.gen::<f64>() < self.rate { 0.0 } else { keep }));
        }
        let mask = Tensor::from_vec(mask, x.shape(), x.device())?.to_dtype(x.dtype())?;
        Ok(x.mul(&mask)?)
    }
}

/// `(1, 1, T, T)` additive mask, f32.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = -1e9;
        }
    }
    Ok(Tensor::from_vec(mask_data, (1, 1, seq_len, seq_len), device)?)
}

/// GELU, tanh approximation:
/// 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
fn gelu(x: &Tensor) -> Result<Tensor> {
    let coeff = (2.0_f64 / std::f64::consts::PI).sqrt();
    let x_cubed = x.mul(&x.mul(x)?)?;
    let inner = ((x + (x_cubed * 0.044715)?)? * coeff)?;
    let tanh_inner = inner.tanh()?;
    Ok((x * 0.5)?.mul(&(tanh_inner + 1.0)?)?)
}
