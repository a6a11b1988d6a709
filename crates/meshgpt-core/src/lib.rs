//! meshgpt core - parameter trees, precision and the device mesh
//!
//! Building blocks shared by the optimizer and the training engine,
//! on top of Hugging Face Candle.

pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod precision;
pub mod rng;
pub mod sharding;
pub mod tree;

pub use config::{GptConfig, DEFAULT_VOCAB_SIZE};
pub use dataset::{write_tokens, Split, TokenFile};
pub use error::{MeshError, Result};
pub use model::{Gpt, LanguageModel};
pub use precision::Policy;
pub use rng::RngKey;
pub use sharding::{shard, shard_params, DeviceMesh, Placement, PlacementRules};
pub use tree::{Node, Param, ParamKind, ParamTree, TreeDef};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
