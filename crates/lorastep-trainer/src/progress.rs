//! Progress reporting cadence and ETA.

/// Whether `step` (1-indexed) gets a progress report.
///
/// Every step through 10, every 5th through 100, every 10th after that. The
/// final step is always reported.
pub fn should_report(step: usize, total_steps: usize) -> bool {
    if step == 0 {
        return false;
    }
    step == total_steps
        || step <= 10
        || (step <= 100 && step % 5 == 0)
        || step % 10 == 0
}

/// Seconds remaining, from measured throughput or the estimator's fallback.
///
/// Returns `None` when no positive rate is available.
pub fn estimate_eta(
    remaining_steps: usize,
    tokens_per_step: usize,
    measured_tokens_per_second: Option<f64>,
    fallback_tokens_per_second: f64,
) -> Option<f64> {
    let rate = measured_tokens_per_second
        .filter(|r| *r > 0.0 && r.is_finite())
        .unwrap_or(fallback_tokens_per_second);
    (rate > 0.0 && rate.is_finite())
        .then(|| (remaining_steps * tokens_per_step) as f64 / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence() {
        let reported: Vec<usize> = (1..=130).filter(|s| should_report(*s, 1000)).collect();
        let mut expected: Vec<usize> = (1..=10).collect();
        expected.extend((15..=100).step_by(5));
        expected.extend([110, 120, 130]);
        assert_eq!(reported, expected);
    }

    #[test]
    fn test_final_step_reported() {
        assert!(should_report(123, 123));
        assert!(!should_report(123, 200));
        assert!(!should_report(0, 10));
    }

    #[test]
    fn test_eta() {
        assert_eq!(estimate_eta(10, 100, Some(500.0), 1.0), Some(2.0));
        assert_eq!(estimate_eta(10, 100, None, 1000.0), Some(1.0));
        assert_eq!(estimate_eta(10, 100, Some(0.0), 250.0), Some(4.0));
        assert_eq!(estimate_eta(10, 100, None, 0.0), None);
    }
}
