//! Error types for dataset preparation.

/// Result type for data operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Error type for tokenization and windowing.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Tokenizer failed to load, encode or decode.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    /// Not enough tokens for a single training sequence.
    #[error("Dataset has {available} tokens, need at least {required}")]
    InsufficientTokens {
        /// Tokens produced by the source.
        available: usize,
        /// Tokens required for one window.
        required: usize,
    },
    /// Token id outside the tokenizer's vocabulary.
    #[error("Token id {id} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange {
        /// Offending id.
        id: u32,
        /// Vocabulary size.
        vocab_size: usize,
    },
    /// Invalid windowing or batching parameters.
    #[error("Invalid data configuration: {0}")]
    Config(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
