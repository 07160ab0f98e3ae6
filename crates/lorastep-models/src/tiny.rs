//! Reference quantized language model.
//!
//! A small residual stack whose projections are frozen 4-bit weights:
//!
//! ```text
//! h = embed(ids)
//! for each layer:
//!     q, k, v = h·Wq, h·Wk, h·Wv        (adapter hook after each)
//!     h = h + (q * sigmoid(k) + v)·Wo    (adapter hook after Wo)
//! logits = h · embedᵀ
//! ```
//!
//! Every projection is `hidden x hidden`, so the gradient at the final hidden
//! state has the shape of every adapted layer's output.

use std::sync::Arc;

use lorastep_compute::{
    matmul, matmul_transpose_b, qmatmul, ComputeContext, GpuBuffer, QuantizedBuffer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, Result};
use crate::traits::{BaseModel, LayerAdapter, LinearLayerInfo, ModelProvider, ModelSource};

/// Projection names inside each layer, in forward order.
pub const PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "o_proj"];

/// Configuration of [`TinyLm`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TinyLmConfig {
    /// Model name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Vocabulary size.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Hidden width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of residual layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Weight initialisation seed.
    #[serde(default)]
    pub seed: u64,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            seed: 0,
        }
    }
}

impl TinyLmConfig {
    fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(ModelError::Config(format!(
                "vocab_size, hidden_size and num_layers must be > 0 (got {}, {}, {})",
                self.vocab_size, self.hidden_size, self.num_layers
            )));
        }
        Ok(())
    }
}

struct TinyLayer {
    names: [String; 4],
    weights: [QuantizedBuffer; 4],
}

/// Reference model with 4-bit projections and a tied output head.
pub struct TinyLm {
    ctx: Arc<ComputeContext>,
    config: TinyLmConfig,
    embedding: GpuBuffer<f32>,
    layers: Vec<TinyLayer>,
}

impl TinyLm {
    /// Build the model with seeded random weights.
    pub fn new(ctx: Arc<ComputeContext>, config: TinyLmConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hidden = config.hidden_size;

        let embedding: Vec<f32> = (0..config.vocab_size * hidden)
            .map(|_| rng.gen_range(-0.5f32..0.5))
            .collect();
        let embedding = GpuBuffer::from_slice(&ctx, &embedding)?;

        let bound = 1.0 / (hidden as f32).sqrt();
        let layers = (0..config.num_layers)
            .map(|i| {
                let names = PROJECTIONS.map(|p| format!("layers.{i}.{p}"));
                let mut pack = || {
                    let values: Vec<f32> = (0..hidden * hidden)
                        .map(|_| rng.gen_range(-bound..bound))
                        .collect();
                    QuantizedBuffer::pack(&ctx, &values, &[hidden, hidden])
                };
                let weights = [pack()?, pack()?, pack()?, pack()?];
                Ok(TinyLayer { names, weights })
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            ctx,
            config,
            embedding,
            layers,
        };
        info!(
            model = %model.config.name,
            layers = model.config.num_layers,
            hidden,
            vocab = model.config.vocab_size,
            bytes = model.memory_bytes(),
            "Built reference model"
        );
        Ok(model)
    }

    /// Model configuration.
    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    fn project(
        &self,
        name: &str,
        weight: &QuantizedBuffer,
        input: &[f32],
        rows: usize,
        adapter: &mut dyn LayerAdapter,
    ) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; rows * self.config.hidden_size];
        qmatmul(&self.ctx, input, weight, &mut out, rows)?;
        adapter.adapt(name, input, rows, &mut out)?;
        Ok(out)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl BaseModel for TinyLm {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn linear_layers(&self) -> Vec<LinearLayerInfo> {
        self.layers
            .iter()
            .flat_map(|layer| layer.names.iter())
            .map(|name| LinearLayerInfo {
                name: name.clone(),
                in_features: self.config.hidden_size,
                out_features: self.config.hidden_size,
            })
            .collect()
    }

    fn forward(&self, input_ids: &[u32], adapter: &mut dyn LayerAdapter) -> Result<Vec<f32>> {
        let rows = input_ids.len();
        let hidden_size = self.config.hidden_size;
        let vocab_size = self.config.vocab_size;
        let table = self.embedding.as_slice();

        let mut hidden = Vec::with_capacity(rows * hidden_size);
        for &id in input_ids {
            let id_usize = id as usize;
            if id_usize >= vocab_size {
                return Err(ModelError::TokenOutOfRange { id, vocab_size });
            }
            hidden.extend_from_slice(&table[id_usize * hidden_size..(id_usize + 1) * hidden_size]);
        }

        for layer in &self.layers {
            let [q_name, k_name, v_name, o_name] = &layer.names;
            let [wq, wk, wv, wo] = &layer.weights;
            let q = self.project(q_name, wq, &hidden, rows, adapter)?;
            let k = self.project(k_name, wk, &hidden, rows, adapter)?;
            let v = self.project(v_name, wv, &hidden, rows, adapter)?;
            let mixed: Vec<f32> = q
                .iter()
                .zip(&k)
                .zip(&v)
                .map(|((q, k), v)| q * sigmoid(*k) + v)
                .collect();
            let o = self.project(o_name, wo, &mixed, rows, adapter)?;
            hidden.iter_mut().zip(&o).for_each(|(h, o)| *h += o);
        }

        let mut logits = vec![0.0f32; rows * vocab_size];
        matmul_transpose_b(
            &self.ctx,
            &hidden,
            table,
            &mut logits,
            rows,
            hidden_size,
            vocab_size,
        )?;
        Ok(logits)
    }

    fn pseudo_gradient(&self, grad_logits: &[f32], rows: usize) -> Result<Vec<f32>> {
        let hidden_size = self.config.hidden_size;
        let mut grad_hidden = vec![0.0f32; rows * hidden_size];
        matmul(
            &self.ctx,
            grad_logits,
            self.embedding.as_slice(),
            &mut grad_hidden,
            rows,
            self.config.vocab_size,
            hidden_size,
        )?;
        Ok(grad_hidden)
    }

    fn memory_bytes(&self) -> u64 {
        self.embedding.size_bytes()
            + self
                .layers
                .iter()
                .flat_map(|layer| layer.weights.iter())
                .map(QuantizedBuffer::size_bytes)
                .sum::<u64>()
    }
}

impl std::fmt::Debug for TinyLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinyLm")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Provider that builds [`TinyLm`] instances.
///
/// `Named` sources resolve only the configured default model name.
#[derive(Debug, Clone, Default)]
pub struct TinyLmProvider {
    default_config: TinyLmConfig,
}

impl TinyLmProvider {
    /// Provider resolving `Named { name }` to `config` when the names match.
    pub fn new(default_config: TinyLmConfig) -> Self {
        Self { default_config }
    }
}

impl ModelProvider for TinyLmProvider {
    fn load(&self, source: &ModelSource, ctx: Arc<ComputeContext>) -> Result<Arc<dyn BaseModel>> {
        let config = match source {
            ModelSource::Tiny(config) => config.clone(),
            ModelSource::Named { name } if *name == self.default_config.name => {
                self.default_config.clone()
            }
            ModelSource::Named { name } => return Err(ModelError::NotFound(name.clone())),
        };
        Ok(Arc::new(TinyLm::new(ctx, config)?))
    }
}

fn default_name() -> String {
    "tiny-lm".to_string()
}

fn default_vocab_size() -> usize {
    256
}

fn default_hidden_size() -> usize {
    32
}

fn default_num_layers() -> usize {
    2
}
