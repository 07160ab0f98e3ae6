//! Common type definitions.

use serde::{Deserialize, Serialize};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Lifecycle status of a training session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    /// No session.
    #[default]
    Idle,
    /// Resources are being acquired.
    Initializing,
    /// Steps are being executed.
    Running,
    /// Suspended at a step boundary.
    Paused,
    /// All steps finished and the adapter was read back.
    Completed,
    /// Stopped by the host.
    Aborted,
    /// Failed during setup or a step.
    Error,
}

impl TrainingStatus {
    /// Whether `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TrainingStatus::*;
        matches!(
            (self, next),
            (Idle | Completed | Aborted | Error, Initializing)
                | (Initializing, Running | Aborted | Error)
                | (Running, Paused | Completed | Aborted | Error)
                | (Paused, Running | Aborted | Error)
        )
    }

    /// Whether a session in this state owns device resources.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Running | Self::Paused)
    }

    /// Whether this is a final state of a session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Error)
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Memory statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Memory budget in bytes.
    pub total_bytes: u64,
    /// Currently allocated bytes.
    pub used_bytes: u64,
    /// Peak allocated bytes.
    pub peak_bytes: u64,
}

impl MemoryStats {
    /// Used memory in gigabytes.
    #[must_use]
    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / GIB
    }

    /// Total memory in gigabytes.
    #[must_use]
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }

    /// Peak memory in gigabytes.
    #[must_use]
    pub fn peak_gb(&self) -> f64 {
        self.peak_bytes as f64 / GIB
    }

    /// Available memory in gigabytes.
    #[must_use]
    pub fn available_gb(&self) -> f64 {
        self.total_bytes.saturating_sub(self.used_bytes) as f64 / GIB
    }
}

/// Metrics recorded after one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// 1-indexed step number.
    pub step: usize,
    /// Training loss.
    pub loss: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Device memory in use, in GB.
    pub memory_usage_gb: f64,
    /// Tokens processed per second during the step.
    pub throughput: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use TrainingStatus::*;
        assert!(Idle.can_transition_to(Initializing));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Aborted));
        assert!(Completed.can_transition_to(Initializing));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Initializing));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TrainingStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(TrainingStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_available_saturates() {
        let stats = MemoryStats {
            total_bytes: 10,
            used_bytes: 20,
            peak_bytes: 20,
        };
        assert_eq!(stats.available_gb(), 0.0);
    }
}
