//! Core trait definitions.

use std::path::Path;

use crate::StepMetrics;

/// Callback trait for training events.
///
/// All methods default to no-ops so implementations only override what they
/// observe.
pub trait TrainingCallback: Send + Sync {
    /// Called once the session is initialized and before the first step.
    fn on_train_start(&mut self) {}

    /// Called after the final step or when training stops early.
    fn on_train_end(&mut self) {}

    /// Called before each step. `step` is 1-indexed.
    fn on_step_start(&mut self, _step: usize) {}

    /// Called after each step with its metrics.
    fn on_step_end(&mut self, _metrics: &StepMetrics) {}

    /// Called when the adapter rank was changed.
    fn on_rank_change(&mut self, _step: usize, _old_rank: usize, _new_rank: usize) {}

    /// Called when an adapter file is written.
    fn on_save(&mut self, _path: &Path) {}
}

/// Estimates training throughput for a device and model.
///
/// Used to seed ETA before any step has been measured.
pub trait ThroughputEstimator: Send + Sync {
    /// Estimated tokens per second.
    fn tokens_per_second(&self, model_name: &str, rank: usize) -> f64;
}

/// Estimator returning one fixed rate regardless of inputs.
#[derive(Debug, Clone, Copy)]
pub struct StaticEstimator {
    /// Tokens per second.
    pub tokens_per_second: f64,
}

impl Default for StaticEstimator {
    fn default() -> Self {
        Self {
            tokens_per_second: 1000.0,
        }
    }
}

impl ThroughputEstimator for StaticEstimator {
    fn tokens_per_second(&self, _model_name: &str, _rank: usize) -> f64 {
        self.tokens_per_second
    }
}
