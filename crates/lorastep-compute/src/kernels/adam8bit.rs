//! Fused 8-bit Adam update.
//!
//! Optimizer moments are stored one byte per element in packed words with a
//! single scale per tensor:
//! - momentum `m` as signed bytes, `m ≈ q * m_scale` with `q ∈ [-127, 127]`
//! - velocity `v` in the square-root domain as unsigned bytes,
//!   `sqrt(v) ≈ q * v_scale` with `q ∈ [0, 255]`
//!
//! Before the update pass the kernel bounds the new moments from the previous
//! scales and `max |g + wd * w|`, so the next scales are known up front and
//! nothing is clipped. The update itself is one parallel pass: dequantize,
//! update moments, bias-correct, step the weight, re-quantize and store.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{check_len, ComputeError, Result};
use crate::kernels::reduce::max_abs_by;
use crate::packed::PackedByteBuffer;

const M_LEVELS: f32 = 127.0;
const V_LEVELS: f32 = 255.0;

/// Hyperparameters for one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam8bitConfig {
    /// Learning rate.
    pub lr: f32,
    /// First moment decay (beta1).
    pub beta1: f32,
    /// Second moment decay (beta2).
    pub beta2: f32,
    /// Epsilon for numerical stability.
    pub eps: f32,
    /// Weight decay folded into the gradient.
    pub weight_decay: f32,
}

impl Default for Adam8bitConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl Adam8bitConfig {
    /// Validate the hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            return Err(ComputeError::InvalidConfig(format!(
                "lr must be finite and >= 0, got {}",
                self.lr
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(ComputeError::InvalidConfig(format!(
                "betas must be in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.eps <= 0.0 {
            return Err(ComputeError::InvalidConfig("eps must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Adam8bitConfig`].
#[derive(Debug, Clone)]
pub struct Adam8bitBuilder {
    config: Adam8bitConfig,
}

impl Adam8bitBuilder {
    /// Create a new builder with the given learning rate.
    pub fn new(lr: f32) -> Self {
        Self {
            config: Adam8bitConfig {
                lr,
                ..Default::default()
            },
        }
    }

    /// Set betas (beta1, beta2).
    pub fn with_betas(mut self, betas: (f32, f32)) -> Self {
        self.config.beta1 = betas.0;
        self.config.beta2 = betas.1;
        self
    }

    /// Set epsilon for numerical stability.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.config.eps = eps;
        self
    }

    /// Set weight decay.
    pub fn with_weight_decay(mut self, wd: f32) -> Self {
        self.config.weight_decay = wd;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Adam8bitConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Packed 8-bit optimizer state for one parameter tensor.
#[derive(Debug)]
pub struct Adam8bitState {
    m: PackedByteBuffer,
    v: PackedByteBuffer,
    m_scale: f32,
    v_scale: f32,
}

impl Adam8bitState {
    /// Zero state for a tensor of `len` elements.
    pub fn zeros(ctx: &ComputeContext, len: usize) -> Result<Self> {
        Ok(Self {
            m: PackedByteBuffer::zeros(ctx, len)?,
            v: PackedByteBuffer::zeros(ctx, len)?,
            m_scale: 0.0,
            v_scale: 0.0,
        })
    }

    /// Number of tracked elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.m.len()
    }

    /// Whether the state tracks no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Current momentum scale.
    #[inline]
    pub fn m_scale(&self) -> f32 {
        self.m_scale
    }

    /// Current velocity scale (square-root domain).
    #[inline]
    pub fn v_scale(&self) -> f32 {
        self.v_scale
    }

    /// Dequantized momentum at `index`.
    #[inline]
    pub fn momentum(&self, index: usize) -> f32 {
        f32::from(self.m.get_signed(index)) * self.m_scale
    }

    /// Dequantized velocity at `index`.
    #[inline]
    pub fn velocity(&self, index: usize) -> f32 {
        let root = f32::from(self.v.get(index)) * self.v_scale;
        root * root
    }

    /// Dequantized momentum for every element.
    pub fn momentum_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.momentum(i)).collect()
    }

    /// Dequantized velocity for every element.
    pub fn velocity_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.velocity(i)).collect()
    }

    /// Bytes of packed state.
    pub fn state_bytes(&self) -> usize {
        (self.m.len().div_ceil(PackedByteBuffer::VALUES_PER_WORD)
            + self.v.len().div_ceil(PackedByteBuffer::VALUES_PER_WORD))
            * 4
    }
}

/// Apply one fused Adam update to `weights`.
///
/// `step` is 1-indexed; zero is rejected because bias correction divides by
/// `1 - beta^step`.
pub fn adam8bit_step(
    ctx: &ComputeContext,
    config: &Adam8bitConfig,
    step: usize,
    weights: &mut [f32],
    grads: &[f32],
    state: &mut Adam8bitState,
) -> Result<()> {
    if step == 0 {
        return Err(ComputeError::InvalidConfig(
            "optimizer step is 1-indexed; step 0 is invalid".into(),
        ));
    }
    config.validate()?;
    check_len("grads", weights.len(), grads.len())?;
    check_len("optimizer_state", weights.len(), state.len())?;
    if weights.is_empty() {
        return Ok(());
    }

    let Adam8bitConfig {
        lr,
        beta1,
        beta2,
        eps,
        weight_decay,
    } = *config;

    let g_max = {
        let weights: &[f32] = weights;
        max_abs_by(ctx, grads.len(), |i| grads[i] + weight_decay * weights[i])
    };
    if !g_max.is_finite() {
        return Err(ComputeError::InvalidConfig(
            "non-finite gradient passed to optimizer".into(),
        ));
    }

    let old_m_scale = state.m_scale;
    let old_v_scale = state.v_scale;
    let m_scale = (beta1 * M_LEVELS * old_m_scale + (1.0 - beta1) * g_max) / M_LEVELS;
    let v_root_bound = (beta2 * (V_LEVELS * old_v_scale).powi(2)
        + (1.0 - beta2) * g_max * g_max)
        .sqrt();
    let v_scale = v_root_bound / V_LEVELS;

    let bias_correction1 = 1.0 - beta1.powi(step as i32);
    let bias_correction2 = 1.0 - beta2.powi(step as i32);

    let m_buf = &state.m;
    let v_buf = &state.v;
    ctx.install(|| {
        weights
            .par_iter_mut()
            .zip(grads.par_iter())
            .enumerate()
            .for_each(|(i, (w, &g))| {
                let g = g + weight_decay * *w;

                let m_prev = f32::from(m_buf.get_signed(i)) * old_m_scale;
                let v_root_prev = f32::from(v_buf.get(i)) * old_v_scale;

                let m = beta1 * m_prev + (1.0 - beta1) * g;
                let v = beta2 * v_root_prev * v_root_prev + (1.0 - beta2) * g * g;

                let m_hat = m / bias_correction1;
                let v_hat = v / bias_correction2;
                *w -= lr * m_hat / (v_hat.sqrt() + eps);

                m_buf.set_signed(i, quantize_momentum(m, m_scale));
                v_buf.set(i, quantize_velocity(v, v_scale));
            });
    });

    state.m_scale = m_scale;
    state.v_scale = v_scale;
    Ok(())
}

#[inline]
fn quantize_momentum(m: f32, scale: f32) -> i8 {
    if scale > 0.0 {
        (m / scale).round().clamp(-M_LEVELS, M_LEVELS) as i8
    } else {
        0
    }
}

/// Rounds up so a stored velocity never understates the true one.
#[inline]
fn quantize_velocity(v: f32, scale: f32) -> u8 {
    if scale > 0.0 {
        (v.max(0.0).sqrt() / scale).ceil().clamp(0.0, V_LEVELS) as u8
    } else {
        0
    }
}
