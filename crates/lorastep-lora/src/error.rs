//! Error types for adapter buffers and adapter files.

use lorastep_compute::ComputeError;

/// Error type for LoRA buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    /// Device allocation or kernel error.
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),
    /// Shape mismatch error.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Invalid state error.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Unknown layer.
    #[error("Layer not found: {0}")]
    LayerNotFound(String),
}

/// Error type for adapter file encoding, decoding and validation.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Input contained no bytes.
    #[error("Adapter file is empty")]
    Empty,
    /// Header or layout could not be parsed.
    #[error("Malformed adapter file: {0}")]
    Malformed(String),
    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    /// `adapter_type` missing or not `lora`.
    #[error("Unknown adapter type: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownAdapterType(Option<String>),
    /// A metadata field is missing or unparsable.
    #[error("Invalid metadata field '{field}': {reason}")]
    InvalidMetadata {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// Tensor dtype the codec cannot widen to f32.
    #[error("Unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDtype {
        /// Tensor name.
        name: String,
        /// Dtype as written in the header.
        dtype: String,
    },
    /// Tensor payload does not match its shape and dtype.
    #[error("Tensor {name} has {actual} bytes, expected {expected}")]
    TensorSize {
        /// Tensor name.
        name: String,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        actual: usize,
    },
    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
