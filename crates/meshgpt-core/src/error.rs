//! Error taxonomy for the core crate.
//!
//! Every variant except `Candle` and `Io` is a fatal configuration or
//! resource error: nothing in the engine retries on them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tree structure mismatch: {0}")]
    StructureMismatch(String),

    #[error("{placed} of {total} parameters have a placement, unplaced: {unplaced:?}")]
    UnplacedParameters {
        placed: usize,
        total: usize,
        unplaced: Vec<String>,
    },

    #[error("cannot shard `{path}` axis {axis} of size {size} across {devices} devices")]
    IndivisibleAxis {
        path: String,
        axis: usize,
        size: usize,
        devices: usize,
    },

    #[error("requested a mesh of {requested} devices but only {available} are available")]
    InsufficientDevices { requested: usize, available: usize },

    #[error("no parameter at path `{0}`")]
    MissingParameter(String),

    #[error("unknown dtype `{0}`, use float32, bfloat16 or float16")]
    UnknownDType(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
