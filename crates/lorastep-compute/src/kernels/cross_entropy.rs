//! Fused softmax cross-entropy forward and backward.
//!
//! One workgroup per position computes the log-sum-exp, the position's loss
//! and its logit gradients in the same pass.

use rayon::prelude::*;

use crate::context::ComputeContext;
use crate::error::{check_len, ComputeError, Result};

/// Label value that excludes a position from the loss.
pub const IGNORE_INDEX: i32 = -100;

/// Loss and logit gradients for a batch of positions.
#[derive(Debug, Clone)]
pub struct CrossEntropyOutput {
    /// Mean loss over counted positions.
    pub loss: f64,
    /// `d loss / d logits`, `[positions, vocab_size]`. Zero at ignored positions.
    pub grad_logits: Vec<f32>,
    /// Number of positions that contributed to the loss.
    pub num_tokens: usize,
}

/// Labels for next-token prediction: position `t` of every sequence predicts
/// token `t + 1`; the last position of each sequence is ignored.
pub fn shifted_labels(input_ids: &[u32], seq_len: usize) -> Vec<i32> {
    if seq_len == 0 {
        return Vec::new();
    }
    input_ids
        .chunks(seq_len)
        .flat_map(|seq| {
            seq.iter()
                .skip(1)
                .map(|&id| id as i32)
                .chain(std::iter::once(IGNORE_INDEX))
        })
        .collect()
}

/// Mean cross-entropy of `logits` (`[positions, vocab_size]`) against `labels`.
pub fn cross_entropy_forward_backward(
    ctx: &ComputeContext,
    logits: &[f32],
    labels: &[i32],
    vocab_size: usize,
) -> Result<CrossEntropyOutput> {
    if vocab_size == 0 {
        return Err(ComputeError::InvalidConfig("vocab_size must be > 0".into()));
    }
    check_len("logits", labels.len() * vocab_size, logits.len())?;
    if let Some(&bad) = labels
        .iter()
        .find(|&&l| l != IGNORE_INDEX && (l < 0 || l as usize >= vocab_size))
    {
        return Err(ComputeError::InvalidConfig(format!(
            "label {bad} outside vocabulary of size {vocab_size}"
        )));
    }

    let num_tokens = labels.iter().filter(|&&l| l != IGNORE_INDEX).count();
    let mut grad_logits = vec![0.0f32; logits.len()];
    if num_tokens == 0 {
        return Ok(CrossEntropyOutput {
            loss: 0.0,
            grad_logits,
            num_tokens,
        });
    }
    let inv_count = 1.0 / num_tokens as f32;

    let losses: Vec<f64> = ctx.install(|| {
        grad_logits
            .par_chunks_mut(vocab_size)
            .zip(logits.par_chunks(vocab_size))
            .zip(labels.par_iter())
            .map(|((grad_row, logit_row), &label)| {
                if label == IGNORE_INDEX {
                    return 0.0;
                }
                let max = logit_row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum_exp: f32 = logit_row.iter().map(|&z| (z - max).exp()).sum();
                let log_sum_exp = max + sum_exp.ln();

                for (g, &z) in grad_row.iter_mut().zip(logit_row) {
                    *g = (z - log_sum_exp).exp() * inv_count;
                }
                let label = label as usize;
                grad_row[label] -= inv_count;

                f64::from(log_sum_exp - logit_row[label])
            })
            .collect()
    });

    Ok(CrossEntropyOutput {
        loss: losses.iter().sum::<f64>() / num_tokens as f64,
        grad_logits,
        num_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_labels() {
        let labels = shifted_labels(&[1, 2, 3, 4, 5, 6], 3);
        assert_eq!(labels, vec![2, 3, IGNORE_INDEX, 5, 6, IGNORE_INDEX]);
    }

    #[test]
    fn test_uniform_logits_loss_is_log_vocab() {
        let ctx = ComputeContext::global().unwrap();
        let vocab = 8;
        let logits = vec![0.0f32; 2 * vocab];
        let out = cross_entropy_forward_backward(&ctx, &logits, &[3, IGNORE_INDEX], vocab).unwrap();
        assert_eq!(out.num_tokens, 1);
        assert!((out.loss - (vocab as f64).ln()).abs() < 1e-6);
        // Ignored row has zero gradient.
        assert!(out.grad_logits[vocab..].iter().all(|&g| g == 0.0));
        // Gradient row sums to zero.
        let row_sum: f32 = out.grad_logits[..vocab].iter().sum();
        assert!(row_sum.abs() < 1e-6);
        assert!(out.grad_logits[3] < 0.0);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let ctx = ComputeContext::global().unwrap();
        let vocab = 5;
        let logits = vec![0.3f32, -1.2, 0.8, 0.1, -0.4, 1.0, 0.2, -0.3, 0.0, 0.5];
        let labels = [2, 4];
        let out = cross_entropy_forward_backward(&ctx, &logits, &labels, vocab).unwrap();

        let eps = 1e-3f32;
        for i in 0..logits.len() {
            let mut plus = logits.clone();
            plus[i] += eps;
            let mut minus = logits.clone();
            minus[i] -= eps;
            let lp = cross_entropy_forward_backward(&ctx, &plus, &labels, vocab).unwrap().loss;
            let lm = cross_entropy_forward_backward(&ctx, &minus, &labels, vocab).unwrap().loss;
            let numeric = (lp - lm) / (2.0 * f64::from(eps));
            assert!((numeric - f64::from(out.grad_logits[i])).abs() < 1e-3);
        }
    }

    #[test]
    fn test_label_out_of_vocab_rejected() {
        let ctx = ComputeContext::global().unwrap();
        assert!(cross_entropy_forward_backward(&ctx, &[0.0; 4], &[4], 4).is_err());
    }

    #[test]
    fn test_all_ignored() {
        let ctx = ComputeContext::global().unwrap();
        let out =
            cross_entropy_forward_backward(&ctx, &[0.0; 4], &[IGNORE_INDEX], 4).unwrap();
        assert_eq!(out.loss, 0.0);
        assert_eq!(out.num_tokens, 0);
    }
}
