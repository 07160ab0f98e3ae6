//! Error types for compute operations.

use std::fmt;

/// Result type for compute operations.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors that can occur during compute operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// No compute device could be created.
    NoDevice(String),

    /// Failed to create buffer.
    BufferCreation {
        /// Size of buffer that failed to allocate, in bytes.
        size: usize,
        /// Reason for failure.
        reason: String,
    },

    /// Allocation would exceed the context's memory budget.
    OutOfMemory {
        /// Bytes requested.
        requested: u64,
        /// Bytes still available in the budget.
        available: u64,
    },

    /// Buffer size mismatch.
    BufferSizeMismatch {
        /// Expected number of elements.
        expected: usize,
        /// Actual number of elements.
        actual: usize,
    },

    /// Index outside a buffer.
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Buffer length.
        len: usize,
    },

    /// Invalid configuration.
    InvalidConfig(String),

    /// Dimension mismatch in operation.
    DimensionMismatch {
        /// Name of the parameter.
        param: &'static str,
        /// Expected value.
        expected: usize,
        /// Actual value.
        actual: usize,
    },

    /// Internal error.
    Internal(String),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::NoDevice(reason) => {
                write!(f, "No compute device available: {}", reason)
            }
            ComputeError::BufferCreation { size, reason } => {
                write!(f, "Failed to create buffer of size {}: {}", size, reason)
            }
            ComputeError::OutOfMemory {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Out of device memory: requested {} bytes, {} bytes available",
                    requested, available
                )
            }
            ComputeError::BufferSizeMismatch { expected, actual } => {
                write!(
                    f,
                    "Buffer size mismatch: expected {} elements, got {}",
                    expected, actual
                )
            }
            ComputeError::IndexOutOfBounds { index, len } => {
                write!(f, "Index {} out of bounds for buffer of length {}", index, len)
            }
            ComputeError::InvalidConfig(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            ComputeError::DimensionMismatch {
                param,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Dimension mismatch for '{}': expected {}, got {}",
                    param, expected, actual
                )
            }
            ComputeError::Internal(msg) => {
                write!(f, "Internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for ComputeError {}

impl From<String> for ComputeError {
    fn from(s: String) -> Self {
        ComputeError::Internal(s)
    }
}

impl From<&str> for ComputeError {
    fn from(s: &str) -> Self {
        ComputeError::Internal(s.to_string())
    }
}

/// Check that a slice has the expected length.
pub(crate) fn check_len(param: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ComputeError::DimensionMismatch {
            param,
            expected,
            actual,
        });
    }
    Ok(())
}
