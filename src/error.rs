//! Model error types.

use thiserror::Error;

/// Errors raised during model construction or a forward pass.
///
/// Construction-time variants (`AttentionUnsupported`,
/// `OddBidirectionalLayers`, `InvalidConfig`) are fatal configuration
/// errors: there is no fallback and no retry.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("attention is not supported by this model")]
    AttentionUnsupported,

    #[error("bidirectional encoder requires an even number of layers, got {0}")]
    OddBidirectionalLayers(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("batch of {got} examples exceeds configured batch size {max}")]
    BatchTooLarge { got: usize, max: usize },

    #[error("token not in vocabulary: {0}")]
    UnknownToken(String),
}

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;
