//! Training session state.

use lorastep_core::{MemoryStats, StepMetrics, TrainingStatus};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

/// Mutable progress of one training session.
///
/// Histories are append-only for the life of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingState {
    /// Lifecycle status.
    pub status: TrainingStatus,
    /// Completed steps.
    pub current_step: usize,
    /// Steps the session will run.
    pub total_steps: usize,
    /// Adapter rank currently allocated.
    pub current_rank: usize,
    /// Loss per step.
    pub loss_history: Vec<f64>,
    /// Tokens per second per step.
    pub throughput_history: Vec<f64>,
    /// Pre-clip gradient norm per step.
    pub grad_norm_history: Vec<f64>,
    /// Memory snapshot after the latest step.
    pub memory: MemoryStats,
}

impl TrainingState {
    /// Fresh state in `Idle`.
    pub fn new(total_steps: usize, rank: usize) -> Self {
        Self {
            status: TrainingStatus::Idle,
            current_step: 0,
            total_steps,
            current_rank: rank,
            loss_history: Vec::new(),
            throughput_history: Vec::new(),
            grad_norm_history: Vec::new(),
            memory: MemoryStats::default(),
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: TrainingStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TrainerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Append one step's metrics.
    pub fn record(&mut self, metrics: &StepMetrics, memory: MemoryStats) {
        self.current_step = metrics.step;
        self.loss_history.push(metrics.loss);
        self.throughput_history.push(metrics.throughput);
        self.grad_norm_history.push(metrics.grad_norm);
        self.memory = memory;
    }

    /// Fraction of steps completed.
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.current_step as f64 / self.total_steps as f64
    }

    /// Loss of the latest step.
    pub fn current_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }

    /// Mean loss over all steps.
    pub fn average_loss(&self) -> Option<f64> {
        mean(&self.loss_history)
    }

    /// Mean throughput over all steps.
    pub fn average_throughput(&self) -> Option<f64> {
        mean(&self.throughput_history)
    }

    /// Mean throughput over the latest `n` steps.
    pub fn recent_throughput(&self, n: usize) -> Option<f64> {
        let start = self.throughput_history.len().saturating_sub(n);
        mean(&self.throughput_history[start..])
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(step: usize, loss: f64, throughput: f64) -> StepMetrics {
        StepMetrics {
            step,
            loss,
            grad_norm: 1.0,
            memory_usage_gb: 0.5,
            throughput,
        }
    }

    #[test]
    fn test_transitions() {
        let mut state = TrainingState::new(10, 4);
        assert!(state.transition(TrainingStatus::Running).is_err());
        state.transition(TrainingStatus::Initializing).unwrap();
        state.transition(TrainingStatus::Running).unwrap();
        state.transition(TrainingStatus::Paused).unwrap();
        assert!(matches!(
            state.transition(TrainingStatus::Completed),
            Err(TrainerError::InvalidTransition {
                from: TrainingStatus::Paused,
                to: TrainingStatus::Completed
            })
        ));
        assert_eq!(state.status, TrainingStatus::Paused);
    }

    #[test]
    fn test_averages() {
        let mut state = TrainingState::new(4, 4);
        assert_eq!(state.average_loss(), None);
        state.record(&metrics(1, 3.0, 100.0), MemoryStats::default());
        state.record(&metrics(2, 1.0, 300.0), MemoryStats::default());
        assert_eq!(state.current_step, 2);
        assert_eq!(state.progress(), 0.5);
        assert_eq!(state.current_loss(), Some(1.0));
        assert_eq!(state.average_loss(), Some(2.0));
        assert_eq!(state.average_throughput(), Some(200.0));
        assert_eq!(state.recent_throughput(1), Some(300.0));
    }
}
