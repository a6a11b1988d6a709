//! meshgpt training engine
//!
//! Batch sampling, gradient accumulation over microbatches and mesh ranks,
//! the optimizer step, evaluation, checkpointing and the outer loop.

pub mod accumulate;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod evaluate;
pub mod metrics;
pub mod step;
pub mod trainer;

pub use accumulate::{accumulate_gradients, loss_fn, LossAndGrads};
pub use batch::{sample_batch, Batch};
pub use checkpoint::{CheckpointManager, CheckpointOptions, CheckpointStore, Restored, SafetensorsStore};
pub use config::ExperimentConfig;
pub use evaluate::{Evaluator, EVAL_ITERS};
pub use metrics::{JsonlSink, MemorySink, MetricRecord, MetricsSink};
pub use step::{StepOutcome, TrainState, TrainStep};
pub use trainer::{Trainer, TrainingSummary};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
