//! Error types for lorastep.

use thiserror::Error;

/// Result type alias for lorastep core operations.
pub type Result<T> = std::result::Result<T, LoraStepError>;

/// Main error type for lorastep core operations.
#[derive(Error, Debug)]
pub enum LoraStepError {
    /// Configuration errors (rejected at the point of use, never clamped).
    #[error("Configuration error: {0}")]
    Config(String),
}
