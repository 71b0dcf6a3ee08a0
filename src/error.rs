//! Error types for `llama-blocks`.

use llama_blocks_kernels::KernelError;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or running the block stack.
///
/// `InvalidConfig` is a construction-time failure: the configuration or the supplied weights
/// can never produce a valid forward pass. Every other variant is raised per call and leaves
/// the model untouched.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or weight layout violates a structural invariant.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },

    /// The requested operation is not supported (e.g., for a specific rank or layout).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Malformed JSON configuration.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl From<KernelError> for Error {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::ShapeMismatch { expected, got } => Error::ShapeMismatch { expected, got },
        }
    }
}
