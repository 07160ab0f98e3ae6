//! Reductions used by gradient clipping and the optimizer.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::kernels::TILE_SIZE;

/// Maximum of `|term(i)|` over `0..n`. Any NaN term makes the result NaN.
pub fn max_abs_by<F>(ctx: &ComputeContext, n: usize, term: F) -> f32
where
    F: Fn(usize) -> f32 + Sync + Send,
{
    ctx.install(|| {
        (0..n)
            .into_par_iter()
            .map(|i| term(i).abs())
            .reduce(
                || 0.0f32,
                |a, b| {
                    if a.is_nan() || b.is_nan() {
                        f32::NAN
                    } else {
                        a.max(b)
                    }
                },
            )
    })
}

/// Sum of squares, reduced per tile and combined in tile order.
pub fn sum_of_squares(ctx: &ComputeContext, data: &[f32]) -> f64 {
    let partials: Vec<f64> = ctx.install(|| {
        data.par_chunks(TILE_SIZE)
            .map(|tile| tile.iter().map(|&v| f64::from(v) * f64::from(v)).sum())
            .collect()
    });
    partials.iter().sum()
}

/// L2 norm across several tensors.
pub fn global_norm(ctx: &ComputeContext, tensors: &[&[f32]]) -> f64 {
    tensors
        .iter()
        .map(|t| sum_of_squares(ctx, t))
        .sum::<f64>()
        .sqrt()
}

/// Multiply every element by `factor`.
pub fn scale_in_place(ctx: &ComputeContext, data: &mut [f32], factor: f32) {
    ctx.install(|| data.par_iter_mut().for_each(|v| *v *= factor));
}

/// Outcome of clipping by global norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipOutcome {
    /// Norm before clipping.
    pub norm: f64,
    /// Factor applied to every gradient (1.0 when not clipped).
    pub scale: f32,
}

/// Rescale `grads` so their joint L2 norm is at most `max_norm`.
///
/// `max_norm <= 0` disables clipping; the norm is still reported.
pub fn clip_by_global_norm(
    ctx: &ComputeContext,
    grads: &mut [&mut [f32]],
    max_norm: f64,
) -> ClipOutcome {
    let norm = {
        let views: Vec<&[f32]> = grads.iter().map(|g| &**g).collect();
        global_norm(ctx, &views)
    };

    let scale = if max_norm > 0.0 && norm.is_finite() && norm > max_norm {
        (max_norm / (norm + 1e-6)) as f32
    } else {
        1.0
    };
    if scale != 1.0 {
        for g in grads.iter_mut() {
            scale_in_place(ctx, g, scale);
        }
    }

    ClipOutcome { norm, scale }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_of_squares() {
        let ctx = ComputeContext::global().unwrap();
        let data: Vec<f32> = (0..200).map(|i| (i % 3) as f32).collect();
        let expected: f64 = data.iter().map(|&v| f64::from(v * v)).sum();
        assert_eq!(sum_of_squares(&ctx, &data), expected);
    }

    #[test]
    fn test_global_norm() {
        let ctx = ComputeContext::global().unwrap();
        let norm = global_norm(&ctx, &[&[3.0], &[4.0]]);
        assert!((norm - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_clip_scales_down() {
        let ctx = ComputeContext::global().unwrap();
        let mut a = vec![3.0f32];
        let mut b = vec![4.0f32];
        let outcome = clip_by_global_norm(&ctx, &mut [a.as_mut_slice(), b.as_mut_slice()], 1.0);
        assert!((outcome.norm - 5.0).abs() < 1e-12);
        assert!((a[0] - 0.6).abs() < 1e-5);
        assert!((b[0] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_clip_disabled_or_under_limit() {
        let ctx = ComputeContext::global().unwrap();
        let mut a = vec![3.0f32, 4.0];
        let outcome = clip_by_global_norm(&ctx, &mut [a.as_mut_slice()], 0.0);
        assert_eq!(outcome.scale, 1.0);
        let outcome = clip_by_global_norm(&ctx, &mut [a.as_mut_slice()], 10.0);
        assert_eq!(outcome.scale, 1.0);
        assert_eq!(a, vec![3.0, 4.0]);
    }

    #[test]
    fn test_max_abs_propagates_nan() {
        let ctx = ComputeContext::global().unwrap();
        let data = [1.0f32, -5.0, 2.0];
        assert_eq!(max_abs_by(&ctx, 3, |i| data[i]), 5.0);
        let bad = [1.0f32, f32::NAN];
        assert!(max_abs_by(&ctx, 2, |i| bad[i]).is_nan());
        assert_eq!(max_abs_by(&ctx, 0, |_| 1.0), 0.0);
    }
}
