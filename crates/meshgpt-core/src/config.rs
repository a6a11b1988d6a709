//! GPT model configuration

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Default vocabulary: GPT-2's 50257 rounded up to a multiple of 64.
pub const DEFAULT_VOCAB_SIZE: usize = 50304;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f64,
    /// Biases in linear layers and LayerNorms.
    pub bias: bool,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self::gpt2_small()
    }
}

impl GptConfig {
    /// 124M GPT-2 layout.
    pub fn gpt2_small() -> Self {
        Self {
            block_size: 1024,
            vocab_size: DEFAULT_VOCAB_SIZE,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            dropout: 0.0,
            bias: true,
        }
    }

    /// Character-level Shakespeare baby GPT.
    pub fn shakespeare_char() -> Self {
        Self {
            block_size: 256,
            vocab_size: 65,
            n_layer: 6,
            n_head: 6,
            n_embd: 384,
            dropout: 0.2,
            bias: false,
        }
    }

    /// Smallest useful model, for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            block_size: 8,
            vocab_size: 16,
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            dropout: 0.0,
            bias: true,
        }
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn num_params(&self) -> usize {
        let c = self.n_embd;
        let b = usize::from(self.bias);
        let per_layer = 2 * (c + b * c)           // ln_1, ln_2
            + (c * 3 * c + b * 3 * c)             // attn.c_attn
            + (c * c + b * c)                     // attn.c_proj
            + (c * 4 * c + b * 4 * c)             // mlp.c_fc
            + (4 * c * c + b * c); // mlp.c_proj
        self.vocab_size * c + self.block_size * c + self.n_layer * per_layer + (c + b * c)
    }

    /// Parameters outside the embeddings. The LM head is tied to `wte`, so
    /// only the position table has to be removed.
    pub fn num_non_embedding_params(&self) -> usize {
        self.num_params() - self.block_size * self.n_embd
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(MeshError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.block_size == 0 || self.vocab_size == 0 || self.n_layer == 0 {
            return Err(MeshError::Config(
                "block_size, vocab_size and n_layer must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MeshError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.vocab_size > u16::MAX as usize + 1 {
            return Err(MeshError::Config(format!(
                "vocab_size {} does not fit 16-bit token ids",
                self.vocab_size
            )));
        }
        Ok(())
    }
}
