//! Error types for base models.

use lorastep_compute::ComputeError;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Error type for model loading and execution.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Kernel dispatch or allocation failed.
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),
    /// No model matches the requested source.
    #[error("Model not found: {0}")]
    NotFound(String),
    /// Invalid model configuration.
    #[error("Invalid model configuration: {0}")]
    Config(String),
    /// Input token outside the vocabulary.
    #[error("Token id {id} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange {
        /// Offending id.
        id: u32,
        /// Vocabulary size.
        vocab_size: usize,
    },
    /// The per-layer adapter hook failed.
    #[error("Adapter hook failed at {layer}: {message}")]
    Adapter {
        /// Layer being adapted.
        layer: String,
        /// Underlying error.
        message: String,
    },
}
