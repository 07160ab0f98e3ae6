//! Model traits.
//!
//! The trainer treats the base model as an opaque oracle: it produces logits
//! for a batch of token ids, calls back into the adapter at every linear layer
//! it exposes, and maps a gradient at the logits back to its final hidden
//! state.

use std::sync::Arc;

use lorastep_compute::ComputeContext;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tiny::TinyLmConfig;

/// A linear layer the model exposes for adaptation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearLayerInfo {
    /// Fully qualified name, e.g. `layers.0.q_proj`.
    pub name: String,
    /// Input features.
    pub in_features: usize,
    /// Output features.
    pub out_features: usize,
}

/// Hook called with the input and base output of every exposed linear layer.
pub trait LayerAdapter {
    /// Add this layer's adapter contribution to `output` in place.
    ///
    /// `input` is `[rows, in_features]`, `output` is `[rows, out_features]`.
    fn adapt(&mut self, layer: &str, input: &[f32], rows: usize, output: &mut [f32])
        -> Result<()>;
}

/// Adapter hook that leaves every layer unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdapter;

impl LayerAdapter for NoAdapter {
    fn adapt(&mut self, _: &str, _: &[f32], _: usize, _: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

/// A frozen causal language model.
pub trait BaseModel: Send + Sync {
    /// Model identifier, recorded in adapter metadata.
    fn name(&self) -> &str;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Width of the final hidden state.
    fn hidden_size(&self) -> usize;

    /// Linear layers in forward order.
    fn linear_layers(&self) -> Vec<LinearLayerInfo>;

    /// Logits `[tokens, vocab_size]` for row-major `input_ids`.
    fn forward(&self, input_ids: &[u32], adapter: &mut dyn LayerAdapter) -> Result<Vec<f32>>;

    /// Map `grad_logits` (`[rows, vocab_size]`) to a gradient at the final
    /// hidden state (`[rows, hidden_size]`).
    fn pseudo_gradient(&self, grad_logits: &[f32], rows: usize) -> Result<Vec<f32>>;

    /// Device bytes held by the frozen weights.
    fn memory_bytes(&self) -> u64;
}

/// Which base model to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    /// Reference model built from a config.
    Tiny(TinyLmConfig),
    /// Model resolved by name through the provider.
    Named {
        /// Model name.
        name: String,
    },
}

impl ModelSource {
    /// Display name of the source.
    pub fn name(&self) -> &str {
        match self {
            Self::Tiny(config) => &config.name,
            Self::Named { name } => name,
        }
    }
}

/// Resolves a [`ModelSource`] to a loaded model.
pub trait ModelProvider: Send + Sync {
    /// Load the model, allocating its weights on `ctx`.
    fn load(&self, source: &ModelSource, ctx: Arc<ComputeContext>) -> Result<Arc<dyn BaseModel>>;
}
