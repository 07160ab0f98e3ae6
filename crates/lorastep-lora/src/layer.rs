//! Per-layer LoRA buffers and the rank-epoch arena that owns them.
//!
//! LoRA adds low-rank trainable matrices next to a frozen linear layer:
//! `y = base(x) + scale * (x · A) · B`, where
//! - `A` is the down-projection (`in_features x rank`), Kaiming-uniform initialised
//! - `B` is the up-projection (`rank x out_features`), zero initialised
//! - `scale = alpha / rank`
//!
//! Every buffer of every layer is sized by the same rank. Changing the rank
//! builds a complete new set of buffers in [`AdapterLayers::reallocate`]
//! before any old buffer is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use lorastep_compute::{
    adam8bit_step, lora_backward, lora_forward, Adam8bitConfig, Adam8bitState, ComputeContext,
    GpuBuffer, LoraKernelConfig,
};
use lorastep_core::scaling_for;
use rand::Rng;
use tracing::{debug, info};

use crate::adapter::{LayerOptimizerState, LayerWeights, OptimizerMoments, WeightMatrix};
use crate::error::LoraError;

/// Shape of a linear layer that receives an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    /// Fully qualified layer name.
    pub name: String,
    /// Input features.
    pub in_features: usize,
    /// Output features.
    pub out_features: usize,
}

impl LayerSpec {
    /// Create a new layer spec.
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
        }
    }
}

/// Saved activations from the last forward pass.
#[derive(Debug, Default)]
struct ForwardCache {
    rows: usize,
    input: Vec<f32>,
    intermediate: Vec<f32>,
}

/// Device buffers for one adapted layer.
#[derive(Debug)]
pub struct LoraLayerBuffers {
    spec: LayerSpec,
    rank: usize,
    scale: f32,
    lora_a: GpuBuffer<f32>,
    lora_b: GpuBuffer<f32>,
    grad_a: GpuBuffer<f32>,
    grad_b: GpuBuffer<f32>,
    state_a: Adam8bitState,
    state_b: Adam8bitState,
    optimizer_step: usize,
    cache: Option<ForwardCache>,
}

impl LoraLayerBuffers {
    /// Allocate a freshly initialised layer.
    pub fn allocate<R: Rng>(
        ctx: &ComputeContext,
        spec: LayerSpec,
        rank: usize,
        alpha: f32,
        rng: &mut R,
    ) -> Result<Self, LoraError> {
        let mut layer = Self::zeros(ctx, spec, rank, alpha)?;
        let bound = kaiming_bound(layer.spec.in_features);
        for value in layer.lora_a.as_mut_slice() {
            *value = rng.gen_range(-bound..bound);
        }
        Ok(layer)
    }

    fn zeros(
        ctx: &ComputeContext,
        spec: LayerSpec,
        rank: usize,
        alpha: f32,
    ) -> Result<Self, LoraError> {
        let a_len = spec.in_features * rank;
        let b_len = rank * spec.out_features;
        Ok(Self {
            lora_a: GpuBuffer::zeros(ctx, a_len)?,
            lora_b: GpuBuffer::zeros(ctx, b_len)?,
            grad_a: GpuBuffer::zeros(ctx, a_len)?,
            grad_b: GpuBuffer::zeros(ctx, b_len)?,
            state_a: Adam8bitState::zeros(ctx, a_len)?,
            state_b: Adam8bitState::zeros(ctx, b_len)?,
            scale: scaling_for(alpha, rank),
            spec,
            rank,
            optimizer_step: 0,
            cache: None,
        })
    }

    /// Build a copy of this layer at `new_rank`.
    ///
    /// The overlapping `min(old, new)` columns of A and rows of B are copied,
    /// new A columns are randomly initialised, new B rows are zero and the
    /// optimizer state starts over.
    pub fn resized<R: Rng>(
        &self,
        ctx: &ComputeContext,
        new_rank: usize,
        alpha: f32,
        rng: &mut R,
    ) -> Result<Self, LoraError> {
        let mut layer = Self::zeros(ctx, self.spec.clone(), new_rank, alpha)?;
        let keep = self.rank.min(new_rank);
        let bound = kaiming_bound(self.spec.in_features);

        let old_a = self.lora_a.as_slice();
        let new_a = layer.lora_a.as_mut_slice();
        for i in 0..self.spec.in_features {
            for r in 0..new_rank {
                new_a[i * new_rank + r] = if r < keep {
                    old_a[i * self.rank + r]
                } else {
                    rng.gen_range(-bound..bound)
                };
            }
        }

        let out = self.spec.out_features;
        layer.lora_b.as_mut_slice()[..keep * out].copy_from_slice(&self.lora_b.as_slice()[..keep * out]);
        Ok(layer)
    }

    /// Layer shape.
    #[inline]
    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    /// Current rank.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// LoRA scale (`alpha / rank`).
    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// A matrix, `[in_features, rank]`.
    #[inline]
    pub fn lora_a(&self) -> &[f32] {
        self.lora_a.as_slice()
    }

    /// B matrix, `[rank, out_features]`.
    #[inline]
    pub fn lora_b(&self) -> &[f32] {
        self.lora_b.as_slice()
    }

    /// Overwrite A and B, e.g. when restoring from an adapter file.
    pub fn load_weights(&mut self, a: &[f32], b: &[f32]) -> Result<(), LoraError> {
        if a.len() != self.lora_a.len() || b.len() != self.lora_b.len() {
            return Err(LoraError::ShapeMismatch(format!(
                "{}: expected A {} / B {} values, got {} / {}",
                self.spec.name,
                self.lora_a.len(),
                self.lora_b.len(),
                a.len(),
                b.len()
            )));
        }
        self.lora_a.copy_from_slice(a)?;
        self.lora_b.copy_from_slice(b)?;
        Ok(())
    }

    /// Gradient of A from the last backward pass.
    #[inline]
    pub fn grad_a(&self) -> &[f32] {
        self.grad_a.as_slice()
    }

    /// Gradient of B from the last backward pass.
    #[inline]
    pub fn grad_b(&self) -> &[f32] {
        self.grad_b.as_slice()
    }

    /// Mutable views of both gradients, for clipping.
    pub fn grads_mut(&mut self) -> [&mut [f32]; 2] {
        [self.grad_a.as_mut_slice(), self.grad_b.as_mut_slice()]
    }

    /// Optimizer steps applied since this layout was allocated.
    #[inline]
    pub fn optimizer_step(&self) -> usize {
        self.optimizer_step
    }

    /// Packed optimizer state for A and B.
    pub fn optimizer_state(&self) -> (&Adam8bitState, &Adam8bitState) {
        (&self.state_a, &self.state_b)
    }

    fn kernel_config(&self, rows: usize) -> LoraKernelConfig {
        LoraKernelConfig::new(
            rows,
            self.spec.in_features,
            self.spec.out_features,
            self.rank,
            self.scale,
        )
    }

    /// Add the adapter branch to `output` and cache activations for backward.
    pub fn forward(
        &mut self,
        ctx: &ComputeContext,
        input: &[f32],
        rows: usize,
        output: &mut [f32],
    ) -> Result<(), LoraError> {
        let config = self.kernel_config(rows);
        let intermediate = lora_forward(
            ctx,
            &config,
            input,
            self.lora_a.as_slice(),
            self.lora_b.as_slice(),
            output,
        )?;
        self.cache = Some(ForwardCache {
            rows,
            input: input.to_vec(),
            intermediate,
        });
        Ok(())
    }

    /// Compute A/B gradients from the upstream gradient of this layer's output.
    pub fn backward(&mut self, ctx: &ComputeContext, grad_output: &[f32]) -> Result<(), LoraError> {
        let cache = self.cache.take().ok_or_else(|| {
            LoraError::InvalidState(format!("{}: backward called before forward", self.spec.name))
        })?;
        let config = self.kernel_config(cache.rows);
        lora_backward(
            ctx,
            &config,
            &cache.input,
            self.lora_b.as_slice(),
            &cache.intermediate,
            grad_output,
            self.grad_a.as_mut_slice(),
            self.grad_b.as_mut_slice(),
        )?;
        Ok(())
    }

    /// Apply one optimizer update to A and B.
    pub fn apply_optimizer(
        &mut self,
        ctx: &ComputeContext,
        config: &Adam8bitConfig,
    ) -> Result<(), LoraError> {
        let step = self.optimizer_step + 1;
        adam8bit_step(
            ctx,
            config,
            step,
            self.lora_a.as_mut_slice(),
            self.grad_a.as_slice(),
            &mut self.state_a,
        )?;
        adam8bit_step(
            ctx,
            config,
            step,
            self.lora_b.as_mut_slice(),
            self.grad_b.as_slice(),
            &mut self.state_b,
        )?;
        self.optimizer_step = step;
        Ok(())
    }

    /// Read A and B back to host memory.
    pub fn read_back(&self) -> LayerWeights {
        LayerWeights {
            a: WeightMatrix {
                shape: vec![self.spec.in_features, self.rank],
                data: self.lora_a.to_vec(),
            },
            b: WeightMatrix {
                shape: vec![self.rank, self.spec.out_features],
                data: self.lora_b.to_vec(),
            },
        }
    }

    /// Dequantized optimizer moments, shaped like A and B.
    pub fn read_back_optimizer_state(&self) -> LayerOptimizerState {
        let moments = |state: &Adam8bitState, shape: Vec<usize>| OptimizerMoments {
            exp_avg: WeightMatrix {
                shape: shape.clone(),
                data: state.momentum_vec(),
            },
            exp_avg_sq: WeightMatrix {
                shape,
                data: state.velocity_vec(),
            },
        };
        LayerOptimizerState {
            a: moments(&self.state_a, vec![self.spec.in_features, self.rank]),
            b: moments(&self.state_b, vec![self.rank, self.spec.out_features]),
        }
    }

    /// Trainable parameter count.
    pub fn num_parameters(&self) -> usize {
        self.lora_a.len() + self.lora_b.len()
    }

    /// Device bytes held by this layer.
    pub fn memory_bytes(&self) -> u64 {
        self.lora_a.size_bytes()
            + self.lora_b.size_bytes()
            + self.grad_a.size_bytes()
            + self.grad_b.size_bytes()
            + (self.state_a.state_bytes() + self.state_b.state_bytes()) as u64
    }
}

fn kaiming_bound(in_features: usize) -> f32 {
    (3.0_f32 / in_features.max(1) as f32).sqrt()
}

/// All adapted layers of a model at one shared rank.
///
/// `epoch` increments on every successful reallocation, so holders of
/// layer-derived data can tell a layout change happened.
#[derive(Debug)]
pub struct AdapterLayers {
    ctx: Arc<ComputeContext>,
    alpha: f32,
    rank: usize,
    epoch: u64,
    layers: BTreeMap<String, LoraLayerBuffers>,
}

impl AdapterLayers {
    /// Allocate every layer at `rank`.
    pub fn allocate<R: Rng>(
        ctx: Arc<ComputeContext>,
        specs: &[LayerSpec],
        rank: usize,
        alpha: f32,
        rng: &mut R,
    ) -> Result<Self, LoraError> {
        let mut layers = BTreeMap::new();
        for spec in specs {
            let layer = LoraLayerBuffers::allocate(&ctx, spec.clone(), rank, alpha, rng)?;
            layers.insert(spec.name.clone(), layer);
        }
        let adapter = Self {
            ctx,
            alpha,
            rank,
            epoch: 0,
            layers,
        };
        info!(
            layers = adapter.layers.len(),
            rank,
            params = adapter.num_parameters(),
            bytes = adapter.memory_bytes(),
            "Allocated LoRA adapter"
        );
        Ok(adapter)
    }

    /// Resize every layer to `new_rank`.
    ///
    /// The complete new layout is built first; if any allocation fails the
    /// error is returned and the current layout is untouched. Old buffers are
    /// released only after the swap.
    pub fn reallocate<R: Rng>(&mut self, new_rank: usize, rng: &mut R) -> Result<(), LoraError> {
        if new_rank == self.rank {
            return Ok(());
        }
        let mut next = BTreeMap::new();
        for (name, layer) in &self.layers {
            next.insert(name.clone(), layer.resized(&self.ctx, new_rank, self.alpha, rng)?);
        }

        let old_rank = self.rank;
        let old = std::mem::replace(&mut self.layers, next);
        drop(old);
        self.rank = new_rank;
        self.epoch += 1;
        debug!(old_rank, new_rank, epoch = self.epoch, "Reallocated LoRA buffers");
        Ok(())
    }

    /// Shared rank.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// LoRA alpha.
    #[inline]
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Current scale (`alpha / rank`).
    #[inline]
    pub fn scaling(&self) -> f32 {
        scaling_for(self.alpha, self.rank)
    }

    /// Layout epoch.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Compute context the buffers live on.
    #[inline]
    pub fn context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    /// Number of adapted layers.
    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer is adapted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Whether `name` is adapted.
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Get one layer.
    pub fn layer(&self, name: &str) -> Option<&LoraLayerBuffers> {
        self.layers.get(name)
    }

    /// Get one layer mutably.
    pub fn layer_mut(&mut self, name: &str) -> Result<&mut LoraLayerBuffers, LoraError> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| LoraError::LayerNotFound(name.to_string()))
    }

    /// Iterate layers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LoraLayerBuffers)> {
        self.layers.iter()
    }

    /// Iterate layers mutably in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut LoraLayerBuffers)> {
        self.layers.iter_mut()
    }

    /// Trainable parameter count across all layers.
    pub fn num_parameters(&self) -> usize {
        self.layers.values().map(LoraLayerBuffers::num_parameters).sum()
    }

    /// Device bytes held across all layers.
    pub fn memory_bytes(&self) -> u64 {
        self.layers.values().map(LoraLayerBuffers::memory_bytes).sum()
    }

    /// Read every layer's A and B back to host memory.
    pub fn read_back(&self) -> BTreeMap<String, LayerWeights> {
        self.layers
            .iter()
            .map(|(name, layer)| (name.clone(), layer.read_back()))
            .collect()
    }

    /// Read every layer's optimizer moments back to host memory.
    pub fn read_back_optimizer_state(&self) -> BTreeMap<String, LayerOptimizerState> {
        self.layers
            .iter()
            .map(|(name, layer)| (name.clone(), layer.read_back_optimizer_state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorastep_compute::{ComputeError, ContextOptions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ctx() -> Arc<ComputeContext> {
        ComputeContext::global().unwrap()
    }

    fn specs() -> Vec<LayerSpec> {
        vec![LayerSpec::new("q_proj", 8, 6), LayerSpec::new("v_proj", 8, 6)]
    }

    #[test]
    fn test_initialisation() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = LoraLayerBuffers::allocate(&ctx(), LayerSpec::new("q", 12, 5), 4, 8.0, &mut rng)
            .unwrap();
        let bound = (3.0f32 / 12.0).sqrt();
        assert_eq!(layer.lora_a().len(), 48);
        assert!(layer.lora_a().iter().all(|v| v.abs() <= bound));
        assert!(layer.lora_a().iter().any(|v| *v != 0.0));
        assert!(layer.lora_b().iter().all(|v| *v == 0.0));
        assert_eq!(layer.scale(), 2.0);
    }

    #[test]
    fn test_grow_preserves_overlap() {
        let ctx = ctx();
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = LoraLayerBuffers::allocate(&ctx, LayerSpec::new("q", 3, 2), 2, 4.0, &mut rng)
            .unwrap();
        layer.load_weights(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[7.0, 8.0, 9.0, 10.0]).unwrap();

        let grown = layer.resized(&ctx, 3, 4.0, &mut rng).unwrap();
        assert_eq!(grown.rank(), 3);
        let a = grown.lora_a();
        assert_eq!((a[0], a[1]), (1.0, 2.0));
        assert_eq!((a[3], a[4]), (3.0, 4.0));
        assert_eq!((a[6], a[7]), (5.0, 6.0));
        assert_eq!(grown.lora_b(), &[7.0, 8.0, 9.0, 10.0, 0.0, 0.0]);
        assert_eq!(grown.optimizer_step(), 0);
        assert!((grown.scale() - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_shrink_truncates() {
        let ctx = ctx();
        let mut rng = StdRng::seed_from_u64(2);
        let mut layer = LoraLayerBuffers::allocate(&ctx, LayerSpec::new("q", 2, 2), 2, 4.0, &mut rng)
            .unwrap();
        layer.load_weights(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0]).unwrap();
        let shrunk = layer.resized(&ctx, 1, 4.0, &mut rng).unwrap();
        assert_eq!(shrunk.lora_a(), &[1.0, 3.0]);
        assert_eq!(shrunk.lora_b(), &[5.0, 6.0]);
    }

    #[test]
    fn test_reallocate_bumps_epoch() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut adapter = AdapterLayers::allocate(ctx(), &specs(), 4, 8.0, &mut rng).unwrap();
        assert_eq!(adapter.epoch(), 0);
        adapter.reallocate(8, &mut rng).unwrap();
        assert_eq!(adapter.rank(), 8);
        assert_eq!(adapter.epoch(), 1);
        for (_, layer) in adapter.iter() {
            assert_eq!(layer.rank(), 8);
            assert_eq!(layer.lora_a().len(), 8 * 8);
            assert_eq!(layer.lora_b().len(), 8 * 6);
        }
        adapter.reallocate(8, &mut rng).unwrap();
        assert_eq!(adapter.epoch(), 1);
    }

    #[test]
    fn test_failed_reallocation_keeps_layout() {
        let ctx = Arc::new(
            ComputeContext::with_options(ContextOptions {
                name: "small".into(),
                num_threads: Some(1),
                memory_budget_bytes: 4096,
            })
            .unwrap(),
        );
        let mut rng = StdRng::seed_from_u64(4);
        let mut adapter = AdapterLayers::allocate(ctx.clone(), &specs(), 2, 4.0, &mut rng).unwrap();
        let before = adapter.read_back();
        let used = ctx.used_bytes();

        let err = adapter.reallocate(32, &mut rng).unwrap_err();
        assert!(matches!(err, LoraError::Compute(ComputeError::OutOfMemory { .. })));
        assert_eq!(adapter.rank(), 2);
        assert_eq!(adapter.epoch(), 0);
        assert_eq!(adapter.read_back(), before);
        assert_eq!(ctx.used_bytes(), used);
    }

    #[test]
    fn test_forward_backward_step_updates_weights() {
        let ctx = ctx();
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = LoraLayerBuffers::allocate(&ctx, LayerSpec::new("q", 4, 3), 2, 4.0, &mut rng)
            .unwrap();
        let rows = 2;
        let input = vec![0.5f32, -0.2, 0.1, 0.3, 0.0, 0.4, -0.1, 0.2];
        let mut output = vec![0.0f32; rows * 3];
        layer.forward(&ctx, &input, rows, &mut output).unwrap();
        // B starts at zero, so the branch contributes nothing yet.
        assert!(output.iter().all(|v| *v == 0.0));

        layer.backward(&ctx, &[1.0, -1.0, 0.5, 0.2, 0.3, -0.4]).unwrap();
        assert!(layer.grad_b().iter().any(|g| *g != 0.0));
        // dA depends on B, which is still zero.
        assert!(layer.grad_a().iter().all(|g| *g == 0.0));

        let b_before = layer.lora_b().to_vec();
        layer.apply_optimizer(&ctx, &Adam8bitConfig { lr: 0.01, ..Default::default() }).unwrap();
        assert_eq!(layer.optimizer_step(), 1);
        assert_ne!(layer.lora_b(), b_before.as_slice());
    }

    #[test]
    fn test_backward_without_forward_errors() {
        let mut rng = StdRng::seed_from_u64(6);
        let ctx = ctx();
        let mut layer = LoraLayerBuffers::allocate(&ctx, LayerSpec::new("q", 2, 2), 1, 1.0, &mut rng)
            .unwrap();
        assert!(matches!(
            layer.backward(&ctx, &[0.0; 2]),
            Err(LoraError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rank_zero_layer() {
        let ctx = ctx();
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = LoraLayerBuffers::allocate(&ctx, LayerSpec::new("q", 2, 2), 0, 8.0, &mut rng)
            .unwrap();
        assert_eq!(layer.scale(), 0.0);
        let mut output = vec![1.0, 2.0];
        layer.forward(&ctx, &[3.0, 4.0], 1, &mut output).unwrap();
        assert_eq!(output, vec![1.0, 2.0]);
        layer.backward(&ctx, &[1.0, 1.0]).unwrap();
        layer.apply_optimizer(&ctx, &Adam8bitConfig::default()).unwrap();
    }
}
