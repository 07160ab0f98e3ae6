//! Matrix product against packed 4-bit weights.
//!
//! Frozen base weights stay packed; each workgroup decodes the nibbles it
//! needs while reducing, so no full-precision copy of the weight exists.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{check_len, ComputeError, Result};
use crate::kernels::tiled_sum;
use crate::quant::QuantizedBuffer;

/// `out[rows, out_features] = x[rows, in_features] · dequant(weight)`.
///
/// `weight` must have shape `[in_features, out_features]`.
pub fn qmatmul(
    ctx: &ComputeContext,
    x: &[f32],
    weight: &QuantizedBuffer,
    out: &mut [f32],
    rows: usize,
) -> Result<()> {
    let (in_features, out_features) = match weight.shape() {
        [i, o] => (*i, *o),
        other => {
            return Err(ComputeError::InvalidConfig(format!(
                "qmatmul weight must be 2-D, got shape {other:?}"
            )))
        }
    };
    check_len("x", rows * in_features, x.len())?;
    check_len("out", rows * out_features, out.len())?;
    if out_features == 0 {
        return Ok(());
    }

    ctx.install(|| {
        out.par_chunks_mut(out_features)
            .enumerate()
            .for_each(|(row, out_row)| {
                let x_row = &x[row * in_features..(row + 1) * in_features];
                for (col, o) in out_row.iter_mut().enumerate() {
                    *o = tiled_sum(in_features, |i| {
                        x_row[i] * weight.decode(i * out_features + col)
                    });
                }
            });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::matmul::matmul;

    #[test]
    fn test_qmatmul_matches_dequantized_matmul() {
        let ctx = ComputeContext::global().unwrap();
        let (rows, in_f, out_f) = (3, 70, 5);
        let w: Vec<f32> = (0..in_f * out_f)
            .map(|i| ((i * 7 % 15) as f32 - 7.0) * 0.1)
            .collect();
        let x: Vec<f32> = (0..rows * in_f).map(|i| (i % 11) as f32 * 0.05).collect();

        let packed = QuantizedBuffer::pack(&ctx, &w, &[in_f, out_f]).unwrap();
        let dense = packed.dequantize(&ctx);

        let mut expected = vec![0.0; rows * out_f];
        matmul(&ctx, &x, &dense, &mut expected, rows, in_f, out_f).unwrap();
        let mut actual = vec![0.0; rows * out_f];
        qmatmul(&ctx, &x, &packed, &mut actual, rows).unwrap();

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_qmatmul_rejects_1d_weight() {
        let ctx = ComputeContext::global().unwrap();
        let packed = QuantizedBuffer::pack(&ctx, &[1.0; 4], &[4]).unwrap();
        let mut out = [0.0; 4];
        assert!(qmatmul(&ctx, &[1.0; 4], &packed, &mut out, 1).is_err());
    }
}
