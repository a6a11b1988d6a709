//! Learning-rate schedule

use serde::{Deserialize, Serialize};

/// Linear warmup from 0 to `peak_lr` over `warmup_steps`, cosine decay to
/// `min_lr` over the following `decay_steps`, then flat at `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    pub peak_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub decay_steps: usize,
}

impl WarmupCosine {
    pub fn new(peak_lr: f64, min_lr: f64, warmup_steps: usize, decay_steps: usize) -> Self {
        Self {
            peak_lr,
            min_lr,
            warmup_steps,
            decay_steps,
        }
    }

    pub fn value(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * step as f64 / self.warmup_steps as f64;
        }
        let since = step - self.warmup_steps;
        if since >= self.decay_steps {
            return self.min_lr;
        }
        let progress = since as f64 / self.decay_steps as f64;
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_lr + (self.peak_lr - self.min_lr) * cosine
    }
}
