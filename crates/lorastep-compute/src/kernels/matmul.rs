//! Dense f32 matrix products.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{check_len, Result};
use crate::kernels::tiled_sum;

/// `out[m, n] = a[m, k] · b[k, n]`, all row-major.
pub fn matmul(
    ctx: &ComputeContext,
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_len("a", m * k, a.len())?;
    check_len("b", k * n, b.len())?;
    check_len("out", m * n, out.len())?;
    if n == 0 {
        return Ok(());
    }

    ctx.install(|| {
        out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
            let a_row = &a[row * k..(row + 1) * k];
            for (col, o) in out_row.iter_mut().enumerate() {
                *o = tiled_sum(k, |i| a_row[i] * b[i * n + col]);
            }
        });
    });
    Ok(())
}

/// `out[m, n] = a[m, k] · b[n, k]ᵀ`, all row-major.
pub fn matmul_transpose_b(
    ctx: &ComputeContext,
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_len("a", m * k, a.len())?;
    check_len("b", n * k, b.len())?;
    check_len("out", m * n, out.len())?;
    if n == 0 {
        return Ok(());
    }

    ctx.install(|| {
        out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
            let a_row = &a[row * k..(row + 1) * k];
            for (col, o) in out_row.iter_mut().enumerate() {
                let b_row = &b[col * k..(col + 1) * k];
                *o = tiled_sum(k, |i| a_row[i] * b_row[i]);
            }
        });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_small() {
        let ctx = ComputeContext::global().unwrap();
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0]; // 3x2
        let mut out = [0.0; 4];
        matmul(&ctx, &a, &b, &mut out, 2, 3, 2).unwrap();
        assert_eq!(out, [4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matmul_transpose_b_matches_matmul() {
        let ctx = ComputeContext::global().unwrap();
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let bt = [1.0, 0.0, 1.0, 0.0, 1.0, 1.0]; // 2x3, transpose of the b above
        let mut out = [0.0; 4];
        matmul_transpose_b(&ctx, &a, &bt, &mut out, 2, 3, 2).unwrap();
        assert_eq!(out, [4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matmul_shape_checked() {
        let ctx = ComputeContext::global().unwrap();
        let mut out = [0.0; 4];
        assert!(matmul(&ctx, &[1.0; 5], &[1.0; 6], &mut out, 2, 3, 2).is_err());
    }
}
