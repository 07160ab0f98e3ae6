//! LoRA forward and backward kernels.
//!
//! LoRA adds a low-rank update to a frozen linear layer:
//! ```text
//! y = base(x) + scale * (x · A) · B
//! ```
//! with `A: [in_features, rank]`, `B: [rank, out_features]` and
//! `scale = alpha / rank`. The forward pass returns the `x · A`
//! intermediate so the backward pass can reuse it.
//!
//! Only the two adapter matrices are differentiated:
//! ```text
//! dB[r, o] = scale * Σ_rows (x·A)[r] * g[o]
//! dA[i, r] = scale * Σ_rows x[i] * Σ_o g[o] * B[r, o]
//! ```

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{check_len, ComputeError, Result};
use crate::kernels::tiled_sum;

/// Configuration for the LoRA kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraKernelConfig {
    /// Flattened token rows (batch * seq_len).
    pub rows: usize,

    /// Input features dimension.
    pub in_features: usize,

    /// Output features dimension.
    pub out_features: usize,

    /// LoRA rank. Zero disables the adapter.
    pub rank: usize,

    /// LoRA scaling factor (alpha / rank).
    pub scale: f32,
}

impl LoraKernelConfig {
    /// Create a new configuration.
    pub fn new(
        rows: usize,
        in_features: usize,
        out_features: usize,
        rank: usize,
        scale: f32,
    ) -> Self {
        Self {
            rows,
            in_features,
            out_features,
            rank,
            scale,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 {
            return Err(ComputeError::InvalidConfig("rows must be > 0".into()));
        }
        if self.in_features == 0 {
            return Err(ComputeError::InvalidConfig("in_features must be > 0".into()));
        }
        if self.out_features == 0 {
            return Err(ComputeError::InvalidConfig(
                "out_features must be > 0".into(),
            ));
        }
        if !self.scale.is_finite() {
            return Err(ComputeError::InvalidConfig(format!(
                "scale must be finite, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    /// Expected input size.
    pub fn input_size(&self) -> usize {
        self.rows * self.in_features
    }

    /// Expected output size.
    pub fn output_size(&self) -> usize {
        self.rows * self.out_features
    }

    /// Expected A matrix size.
    pub fn a_size(&self) -> usize {
        self.in_features * self.rank
    }

    /// Expected B matrix size.
    pub fn b_size(&self) -> usize {
        self.rank * self.out_features
    }

    /// Expected intermediate (x · A) size.
    pub fn intermediate_size(&self) -> usize {
        self.rows * self.rank
    }
}

/// Apply the LoRA branch in place: `output += scale * (x · A) · B`.
///
/// Returns the `x · A` intermediate (`[rows, rank]`). With rank 0 the output
/// is left untouched and the intermediate is empty.
pub fn lora_forward(
    ctx: &ComputeContext,
    config: &LoraKernelConfig,
    x: &[f32],
    a: &[f32],
    b: &[f32],
    output: &mut [f32],
) -> Result<Vec<f32>> {
    config.validate()?;
    check_len("x", config.input_size(), x.len())?;
    check_len("lora_a", config.a_size(), a.len())?;
    check_len("lora_b", config.b_size(), b.len())?;
    check_len("output", config.output_size(), output.len())?;

    let LoraKernelConfig {
        in_features,
        out_features,
        rank,
        scale,
        ..
    } = *config;
    if rank == 0 {
        return Ok(Vec::new());
    }

    let mut intermediate = vec![0.0f32; config.intermediate_size()];
    ctx.install(|| {
        intermediate
            .par_chunks_mut(rank)
            .enumerate()
            .for_each(|(row, inter_row)| {
                let x_row = &x[row * in_features..(row + 1) * in_features];
                for (r, value) in inter_row.iter_mut().enumerate() {
                    *value = tiled_sum(in_features, |i| x_row[i] * a[i * rank + r]);
                }
            });

        let intermediate = &intermediate;
        output
            .par_chunks_mut(out_features)
            .enumerate()
            .for_each(|(row, out_row)| {
                let inter_row = &intermediate[row * rank..(row + 1) * rank];
                for (o, value) in out_row.iter_mut().enumerate() {
                    *value += scale * tiled_sum(rank, |r| inter_row[r] * b[r * out_features + o]);
                }
            });
    });

    Ok(intermediate)
}

/// Compute adapter gradients, overwriting `grad_a` and `grad_b`.
///
/// `grad_output` is the upstream gradient of the layer output
/// (`[rows, out_features]`) and `intermediate` the value returned by
/// [`lora_forward`] for the same inputs.
#[allow(clippy::too_many_arguments)]
pub fn lora_backward(
    ctx: &ComputeContext,
    config: &LoraKernelConfig,
    x: &[f32],
    b: &[f32],
    intermediate: &[f32],
    grad_output: &[f32],
    grad_a: &mut [f32],
    grad_b: &mut [f32],
) -> Result<()> {
    config.validate()?;
    check_len("x", config.input_size(), x.len())?;
    check_len("lora_b", config.b_size(), b.len())?;
    check_len("intermediate", config.intermediate_size(), intermediate.len())?;
    check_len("grad_output", config.output_size(), grad_output.len())?;
    check_len("grad_a", config.a_size(), grad_a.len())?;
    check_len("grad_b", config.b_size(), grad_b.len())?;

    let LoraKernelConfig {
        rows,
        in_features,
        out_features,
        rank,
        scale,
    } = *config;
    if rank == 0 {
        return Ok(());
    }

    ctx.install(|| {
        // g · Bᵀ, shared by every dA column.
        let mut grad_inter = vec![0.0f32; rows * rank];
        grad_inter
            .par_chunks_mut(rank)
            .enumerate()
            .for_each(|(row, gi_row)| {
                let g_row = &grad_output[row * out_features..(row + 1) * out_features];
                for (r, value) in gi_row.iter_mut().enumerate() {
                    let b_row = &b[r * out_features..(r + 1) * out_features];
                    *value = tiled_sum(out_features, |o| g_row[o] * b_row[o]);
                }
            });

        grad_b
            .par_chunks_mut(out_features)
            .enumerate()
            .for_each(|(r, gb_row)| {
                for (o, value) in gb_row.iter_mut().enumerate() {
                    *value = scale
                        * tiled_sum(rows, |row| {
                            intermediate[row * rank + r] * grad_output[row * out_features + o]
                        });
                }
            });

        let grad_inter = &grad_inter;
        grad_a
            .par_chunks_mut(rank)
            .enumerate()
            .for_each(|(i, ga_row)| {
                for (r, value) in ga_row.iter_mut().enumerate() {
                    *value = scale
                        * tiled_sum(rows, |row| {
                            x[row * in_features + i] * grad_inter[row * rank + r]
                        });
                }
            });
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;

    fn pattern(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (((i * 31 + seed * 17) % 23) as f32 - 11.0) * 0.03)
            .collect()
    }

    fn naive_forward(cfg: &LoraKernelConfig, x: &[f32], a: &[f32], b: &[f32]) -> Vec<f64> {
        let mut out = vec![0.0f64; cfg.output_size()];
        for row in 0..cfg.rows {
            for o in 0..cfg.out_features {
                let mut acc = 0.0f64;
                for r in 0..cfg.rank {
                    let mut inter = 0.0f64;
                    for i in 0..cfg.in_features {
                        inter += f64::from(x[row * cfg.in_features + i])
                            * f64::from(a[i * cfg.rank + r]);
                    }
                    acc += inter * f64::from(b[r * cfg.out_features + o]);
                }
                out[row * cfg.out_features + o] = f64::from(cfg.scale) * acc;
            }
        }
        out
    }

    #[test]
    fn test_forward_matches_reference() {
        let ctx = ComputeContext::global().unwrap();
        let cfg = LoraKernelConfig::new(5, 130, 7, 4, 2.0);
        let x = pattern(cfg.input_size(), 1);
        let a = pattern(cfg.a_size(), 2);
        let b = pattern(cfg.b_size(), 3);
        let base = pattern(cfg.output_size(), 4);

        let mut output = base.clone();
        let inter = lora_forward(&ctx, &cfg, &x, &a, &b, &mut output).unwrap();
        assert_eq!(inter.len(), cfg.intermediate_size());

        let expected = naive_forward(&cfg, &x, &a, &b);
        for ((o, e), base) in output.iter().zip(&expected).zip(&base) {
            assert!((f64::from(*o - *base) - e).abs() < 1e-4, "{o} vs {e}");
        }
    }

    #[test]
    fn test_rank_zero_is_noop() {
        let ctx = ComputeContext::global().unwrap();
        let cfg = LoraKernelConfig::new(2, 3, 4, 0, 0.0);
        let base = pattern(8, 9);
        let mut output = base.clone();
        let inter = lora_forward(&ctx, &cfg, &pattern(6, 1), &[], &[], &mut output).unwrap();
        assert!(inter.is_empty());
        assert_eq!(output, base);

        lora_backward(&ctx, &cfg, &pattern(6, 1), &[], &[], &base, &mut [], &mut []).unwrap();
    }

    #[test]
    fn test_zero_b_leaves_output_unchanged() {
        let ctx = ComputeContext::global().unwrap();
        let cfg = LoraKernelConfig::new(3, 8, 8, 2, 4.0);
        let base = pattern(cfg.output_size(), 5);
        let mut output = base.clone();
        lora_forward(
            &ctx,
            &cfg,
            &pattern(cfg.input_size(), 1),
            &pattern(cfg.a_size(), 2),
            &vec![0.0; cfg.b_size()],
            &mut output,
        )
        .unwrap();
        assert_eq!(output, base);
    }

    #[test]
    fn test_backward_matches_reference() {
        let ctx = ComputeContext::global().unwrap();
        let cfg = LoraKernelConfig::new(6, 9, 5, 3, 0.5);
        let x = pattern(cfg.input_size(), 1);
        let a = pattern(cfg.a_size(), 2);
        let b = pattern(cfg.b_size(), 3);
        let g = pattern(cfg.output_size(), 4);

        let mut output = vec![0.0; cfg.output_size()];
        let inter = lora_forward(&ctx, &cfg, &x, &a, &b, &mut output).unwrap();
        let mut grad_a = vec![0.0; cfg.a_size()];
        let mut grad_b = vec![0.0; cfg.b_size()];
        lora_backward(&ctx, &cfg, &x, &b, &inter, &g, &mut grad_a, &mut grad_b).unwrap();

        let (rows, inf, outf, rank) = (cfg.rows, cfg.in_features, cfg.out_features, cfg.rank);
        let scale = f64::from(cfg.scale);
        for r in 0..rank {
            for o in 0..outf {
                let expected: f64 = (0..rows)
                    .map(|row| f64::from(inter[row * rank + r]) * f64::from(g[row * outf + o]))
                    .sum::<f64>()
                    * scale;
                assert!((f64::from(grad_b[r * outf + o]) - expected).abs() < 1e-5);
            }
        }
        for i in 0..inf {
            for r in 0..rank {
                let expected: f64 = (0..rows)
                    .map(|row| {
                        let gb: f64 = (0..outf)
                            .map(|o| f64::from(g[row * outf + o]) * f64::from(b[r * outf + o]))
                            .sum();
                        f64::from(x[row * inf + i]) * gb
                    })
                    .sum::<f64>()
                    * scale;
                assert!((f64::from(grad_a[i * rank + r]) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_results_independent_of_thread_count() {
        let cfg = LoraKernelConfig::new(17, 200, 33, 8, 1.5);
        let x = pattern(cfg.input_size(), 1);
        let a = pattern(cfg.a_size(), 2);
        let b = pattern(cfg.b_size(), 3);
        let g = pattern(cfg.output_size(), 4);

        let run = |threads: usize| {
            let ctx = ComputeContext::with_options(ContextOptions {
                num_threads: Some(threads),
                ..Default::default()
            })
            .unwrap();
            let mut output = vec![0.0; cfg.output_size()];
            let inter = lora_forward(&ctx, &cfg, &x, &a, &b, &mut output).unwrap();
            let mut grad_a = vec![0.0; cfg.a_size()];
            let mut grad_b = vec![0.0; cfg.b_size()];
            lora_backward(&ctx, &cfg, &x, &b, &inter, &g, &mut grad_a, &mut grad_b).unwrap();
            (output, grad_a, grad_b)
        };

        let single = run(1);
        let multi = run(4);
        assert_eq!(single, multi);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let ctx = ComputeContext::global().unwrap();
        let cfg = LoraKernelConfig::new(2, 4, 4, 2, 1.0);
        let mut output = vec![0.0; 8];
        let err = lora_forward(&ctx, &cfg, &[0.0; 8], &[0.0; 7], &[0.0; 8], &mut output)
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::DimensionMismatch { param: "lora_a", expected: 8, actual: 7 }
        ));
    }
}
