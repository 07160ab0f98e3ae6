//! Compute kernels.
//!
//! Every kernel parallelises over independent output elements (one workgroup
//! per row or column) and reduces along the contraction axis in fixed
//! [`TILE_SIZE`] tiles, accumulating tile partials in ascending order. The
//! reduction order therefore never depends on the number of worker threads.

pub mod adam8bit;
pub mod cross_entropy;
pub mod lora;
pub mod matmul;
pub mod qmatmul;
pub mod reduce;

/// Reduction tile size shared by all kernels.
pub const TILE_SIZE: usize = 64;

/// Sum `term(k)` for `k in 0..n` in fixed-order tiles.
#[inline]
pub(crate) fn tiled_sum(n: usize, term: impl Fn(usize) -> f32) -> f32 {
    let mut total = 0.0f32;
    let mut start = 0;
    while start < n {
        let end = (start + TILE_SIZE).min(n);
        let mut partial = 0.0f32;
        for k in start..end {
            partial += term(k);
        }
        total += partial;
        start = end;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiled_sum_matches_sequential_for_integers() {
        let n = 1000;
        let total = tiled_sum(n, |k| k as f32);
        assert_eq!(total, (n * (n - 1) / 2) as f32);
        assert_eq!(tiled_sum(0, |_| 1.0), 0.0);
    }
}
