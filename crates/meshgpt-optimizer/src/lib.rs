//! meshgpt optimizer
//!
//! AdamW with global-norm clipping and a warmup-cosine learning-rate
//! schedule, as a pure transformation over parameter trees.

pub mod adamw;
pub mod schedule;

pub use adamw::{apply_updates, global_norm, AdamWConfig, OptState, ScheduledAdamW, UpdateStats};
pub use schedule::WarmupCosine;

/// meshgpt optimizer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
