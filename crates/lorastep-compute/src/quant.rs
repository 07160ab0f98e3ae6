//! 4-bit quantized tensor codec.
//!
//! Each value is stored as `q = clamp(round(v / scale) + zero_point, -8, 7)`
//! in a [`PackedNibbleBuffer`] and decoded as `(q - zero_point) * scale`.
//! Values outside the representable range are clamped, never rejected.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{ComputeError, Result};
use crate::packed::PackedNibbleBuffer;

/// Smallest representable 4-bit value.
pub const Q4_MIN: i8 = -8;
/// Largest representable 4-bit value.
pub const Q4_MAX: i8 = 7;

/// Quantize one value.
#[inline]
pub fn quantize_value(value: f32, scale: f32, zero_point: i8) -> i8 {
    let q = (value / scale).round() + f32::from(zero_point);
    // NaN input maps to the zero point.
    if q.is_nan() {
        return zero_point;
    }
    q.clamp(f32::from(Q4_MIN), f32::from(Q4_MAX)) as i8
}

/// Dequantize one value.
#[inline]
pub fn dequantize_value(q: i8, scale: f32, zero_point: i8) -> f32 {
    f32::from(q - zero_point) * scale
}

/// Pick a scale that maps the value range onto `[-8, 7]` with zero point 0.
pub fn scale_for_range(values: &[f32]) -> f32 {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let scale = (-min / 8.0).max(max / 7.0);
    if scale > 0.0 && scale.is_finite() {
        scale
    } else {
        1.0
    }
}

/// Packed 4-bit tensor with a per-tensor scale and zero point.
#[derive(Debug)]
pub struct QuantizedBuffer {
    data: PackedNibbleBuffer,
    scale: f32,
    zero_point: i8,
    shape: Vec<usize>,
}

impl QuantizedBuffer {
    /// Quantize `values` with a scale derived from their range.
    pub fn pack(ctx: &ComputeContext, values: &[f32], shape: &[usize]) -> Result<Self> {
        Self::pack_with(ctx, values, shape, scale_for_range(values), 0)
    }

    /// Quantize `values` with an explicit scale and zero point.
    pub fn pack_with(
        ctx: &ComputeContext,
        values: &[f32],
        shape: &[usize],
        scale: f32,
        zero_point: i8,
    ) -> Result<Self> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(ComputeError::InvalidConfig(format!(
                "quantization scale must be positive and finite, got {scale}"
            )));
        }
        if !(Q4_MIN..=Q4_MAX).contains(&zero_point) {
            return Err(ComputeError::InvalidConfig(format!(
                "zero_point must be in [{Q4_MIN}, {Q4_MAX}], got {zero_point}"
            )));
        }
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(ComputeError::BufferSizeMismatch {
                expected: numel,
                actual: values.len(),
            });
        }

        let data = PackedNibbleBuffer::zeros(ctx, values.len())?;
        ctx.install(|| {
            values
                .par_iter()
                .enumerate()
                .for_each(|(i, &v)| data.set(i, quantize_value(v, scale, zero_point)));
        });

        Ok(Self {
            data,
            scale,
            zero_point,
            shape: shape.to_vec(),
        })
    }

    /// Decode the value at `index`.
    pub fn unpack(&self, index: usize) -> Result<f32> {
        if index >= self.data.len() {
            return Err(ComputeError::IndexOutOfBounds {
                index,
                len: self.data.len(),
            });
        }
        Ok(self.decode(index))
    }

    #[inline]
    pub(crate) fn decode(&self, index: usize) -> f32 {
        dequantize_value(self.data.get(index), self.scale, self.zero_point)
    }

    /// Raw 4-bit code at `index`.
    pub fn code(&self, index: usize) -> Result<i8> {
        if index >= self.data.len() {
            return Err(ComputeError::IndexOutOfBounds {
                index,
                len: self.data.len(),
            });
        }
        Ok(self.data.get(index))
    }

    /// Decode the whole tensor.
    pub fn dequantize(&self, ctx: &ComputeContext) -> Vec<f32> {
        ctx.install(|| {
            (0..self.data.len())
                .into_par_iter()
                .map(|i| self.decode(i))
                .collect()
        })
    }

    /// Per-tensor scale.
    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Zero point.
    #[inline]
    pub fn zero_point(&self) -> i8 {
        self.zero_point
    }

    /// Logical shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of values.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Packed storage in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.data.num_words() * 4) as u64
    }
}
