//! Compute device, buffers and training kernels for lorastep.
//!
//! This crate provides the quantized compute pipeline used by LoRA training:
//!
//! - **Device management**: a shared [`ComputeContext`] with a worker pool
//!   and a memory budget every buffer is charged against
//! - **Buffers**: typed [`GpuBuffer`]s and sub-word [`PackedNibbleBuffer`] /
//!   [`PackedByteBuffer`] with atomic per-lane writes
//! - **Quantization**: the 4-bit [`QuantizedBuffer`] codec
//! - **Kernels**: LoRA forward/backward, packed 4-bit matmul, fused 8-bit
//!   Adam, gradient-norm clipping and fused cross-entropy
//!
//! # Example
//!
//! ```ignore
//! use lorastep_compute::{ComputeContext, LoraKernelConfig, lora_forward};
//!
//! let ctx = ComputeContext::global()?;
//! let config = LoraKernelConfig::new(rows, in_features, out_features, rank, alpha / rank as f32);
//! let intermediate = lora_forward(&ctx, &config, &x, &a, &b, &mut output)?;
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod context;
pub mod error;
pub mod kernels;
pub mod packed;
pub mod quant;

pub use buffer::GpuBuffer;
pub use context::{Allocation, ComputeContext, ContextOptions, DeviceProperties};
pub use error::{ComputeError, Result};
pub use kernels::adam8bit::{adam8bit_step, Adam8bitBuilder, Adam8bitConfig, Adam8bitState};
pub use kernels::cross_entropy::{
    cross_entropy_forward_backward, shifted_labels, CrossEntropyOutput, IGNORE_INDEX,
};
pub use kernels::lora::{lora_backward, lora_forward, LoraKernelConfig};
pub use kernels::matmul::{matmul, matmul_transpose_b};
pub use kernels::qmatmul::qmatmul;
pub use kernels::reduce::{clip_by_global_norm, global_norm, ClipOutcome};
pub use packed::{PackedByteBuffer, PackedNibbleBuffer};
pub use quant::QuantizedBuffer;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::buffer::GpuBuffer;
    pub use crate::context::ComputeContext;
    pub use crate::error::{ComputeError, Result};
    pub use crate::kernels::adam8bit::{Adam8bitConfig, Adam8bitState};
    pub use crate::kernels::lora::LoraKernelConfig;
    pub use crate::quant::QuantizedBuffer;
}
