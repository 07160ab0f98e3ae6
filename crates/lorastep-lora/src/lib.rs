//! LoRA adapter state for lorastep.
//!
//! This crate owns everything that is sized by the adapter rank:
//!
//! - [`AdapterLayers`]: per-layer A/B weights, gradients and 8-bit optimizer
//!   state on the compute device, reallocated as a whole when the rank changes
//! - [`AdapterData`]: the host-side copy of a trained adapter
//! - the adapter file codec ([`serialize`], [`deserialize`]) and
//!   [`validate_adapter_file`] for inspecting files before import
//!
//! # Example
//!
//! ```ignore
//! use lorastep_lora::{AdapterLayers, LayerSpec};
//!
//! let specs = vec![LayerSpec::new("layers.0.q_proj", 64, 64)];
//! let mut layers = AdapterLayers::allocate(ctx, &specs, 8, 16.0, &mut rng)?;
//! layers.reallocate(16, &mut rng)?;
//! assert_eq!(layers.epoch(), 1);
//! ```

#![warn(missing_docs)]

pub mod adapter;
mod error;
pub mod layer;
mod validation;

pub use adapter::{
    deserialize, serialize, AdapterData, AdapterMetadata, LayerOptimizerState, LayerWeights,
    NamedTensors, OptimizerMoments, TensorData, TensorDtype, TensorRole, WeightMatrix,
    ADAPTER_TYPE, FORMAT_VERSION,
};
pub use error::{AdapterError, LoraError};
pub use layer::{AdapterLayers, LayerSpec, LoraLayerBuffers};
pub use validation::{validate_adapter_file, ValidationReport, ValidationWarning};
