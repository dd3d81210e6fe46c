use crate::distributed::LogicalAxis;
use crate::tensor::TensorError;
use thiserror::Error;

/// Every failure the model, its cache, the optimizer and the checkpoint manager can report.
///
/// None of these are retried; a step either completes or returns one of them.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown logical axis `{0}`")]
    UnknownLogicalAxis(String),

    #[error("Mesh axis `{0}` is not defined on this mesh")]
    UnknownMeshAxis(String),

    #[error("Mesh axis `{mesh_axis}` shards both `{first}` and `{second}` of the same tensor")]
    DuplicateMeshAxis {
        mesh_axis: String,
        first: LogicalAxis,
        second: LogicalAxis,
    },

    #[error(
        "Logical axis `{axis}` has size {size}, which does not split evenly over the {devices} devices of mesh axis `{mesh_axis}`"
    )]
    IndivisibleAxis {
        axis: LogicalAxis,
        size: usize,
        mesh_axis: String,
        devices: usize,
    },

    #[error("Logical axis `{axis}` expects size {expected}, got {got}")]
    AxisSize {
        axis: LogicalAxis,
        expected: usize,
        got: usize,
    },

    #[error("Sequence overflow: row {row} would write up to position {end}, but max_seq_len is {max}")]
    SequenceOverflow { row: usize, end: usize, max: usize },

    #[error("The attention kernel is training-only and cannot be used with a KV cache")]
    KernelWithCache,

    #[error("Token id {token} is outside the vocabulary of size {vocab}")]
    TokenOutOfRange { token: i32, vocab: usize },

    #[error("Batch contains no valid (non-padding) tokens")]
    NoValidTokens,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<minformer_kernels::KernelError> for Error {
    fn from(err: minformer_kernels::KernelError) -> Self {
        match err {
            minformer_kernels::KernelError::ShapeMismatch { expected, got } => {
                Error::Tensor(TensorError::ShapeMismatch { expected, got })
            }
        }
    }
}
