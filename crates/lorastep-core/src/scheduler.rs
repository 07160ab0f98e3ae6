//! Learning rate schedules.
//!
//! Steps are 0-indexed here: `get_lr(0)` is the rate applied by the first
//! optimizer update. Warmup ramps linearly and reaches the peak rate on its
//! last step, so no update ever runs at a zero rate.

use std::f64::consts::PI;

use crate::{LrSchedulerType, TrainingConfig};

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    peak_lr: f64,
    floor_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    kind: LrSchedulerType,
    position: usize,
}

impl LearningRateScheduler {
    /// Schedule decaying from `peak_lr` towards zero over `total_steps`.
    pub fn new(
        peak_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        kind: LrSchedulerType,
    ) -> Self {
        Self {
            peak_lr,
            floor_lr: 0.0,
            total_steps,
            warmup_steps: warmup_steps.min(total_steps),
            kind,
            position: 0,
        }
    }

    /// Schedule described by a training configuration.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.learning_rate,
            config.max_steps,
            config.warmup_steps,
            config.lr_scheduler,
        )
    }

    /// Decay towards `floor_lr` instead of zero.
    pub fn with_floor(mut self, floor_lr: f64) -> Self {
        self.floor_lr = floor_lr.clamp(0.0, self.peak_lr);
        self
    }

    /// Rate for `step`.
    #[must_use]
    pub fn get_lr(&self, step: usize) -> f64 {
        let span = self.peak_lr - self.floor_lr;
        if step < self.warmup_steps {
            return self.floor_lr + span * (step + 1) as f64 / self.warmup_steps as f64;
        }

        let decay_steps = self.total_steps - self.warmup_steps;
        if decay_steps == 0 {
            return self.peak_lr;
        }
        let t = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        let remaining = match self.kind {
            LrSchedulerType::Constant => return self.peak_lr,
            LrSchedulerType::Linear => 1.0 - t,
            LrSchedulerType::Cosine => 0.5 * (1.0 + (PI * t).cos()),
        };
        self.floor_lr + span * remaining
    }

    /// Rate for the next update.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.position)
    }

    /// Record one applied update.
    pub fn step(&mut self) {
        self.position += 1;
    }

    /// Updates recorded so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_constant() {
        let s = LearningRateScheduler::new(1e-4, 1000, 0, LrSchedulerType::Constant);
        assert!(close(s.get_lr(0), 1e-4));
        assert!(close(s.get_lr(999), 1e-4));
    }

    #[test]
    fn test_linear_decay() {
        let s = LearningRateScheduler::new(1e-3, 4, 0, LrSchedulerType::Linear);
        let rates: Vec<f64> = (0..4).map(|step| s.get_lr(step)).collect();
        for (rate, expected) in rates.iter().zip([1e-3, 7.5e-4, 5e-4, 2.5e-4]) {
            assert!(close(*rate, expected), "{rate} != {expected}");
        }
    }

    #[test]
    fn test_warmup_reaches_peak() {
        let s = LearningRateScheduler::new(1e-4, 1000, 100, LrSchedulerType::Cosine);
        assert!(close(s.get_lr(0), 1e-6));
        assert!(s.get_lr(0) < s.get_lr(50));
        assert!(close(s.get_lr(99), 1e-4));
        assert!(close(s.get_lr(100), 1e-4));
    }

    #[test]
    fn test_cosine_floor() {
        let s = LearningRateScheduler::new(1e-4, 100, 0, LrSchedulerType::Cosine).with_floor(1e-6);
        assert!(s.get_lr(50) < 1e-4);
        assert!(close(s.get_lr(100), 1e-6));
    }

    #[test]
    fn test_warmup_longer_than_run() {
        let s = LearningRateScheduler::new(1e-3, 2, 10, LrSchedulerType::Linear);
        assert!(close(s.get_lr(0), 5e-4));
        assert!(close(s.get_lr(1), 1e-3));
    }

    #[test]
    fn test_from_config_tracks_position() {
        let config = TrainingConfig {
            learning_rate: 2e-3,
            max_steps: 2,
            lr_scheduler: LrSchedulerType::Linear,
            ..Default::default()
        };
        let mut s = LearningRateScheduler::from_config(&config);
        assert!(close(s.current_lr(), 2e-3));
        s.step();
        assert_eq!(s.position(), 1);
        assert!(close(s.current_lr(), 1e-3));
    }
}
