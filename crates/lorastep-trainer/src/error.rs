//! Error types for training sessions.

use lorastep_core::{LoraStepError, TrainingStatus};
use lorastep_lora::AdapterError;

/// Result type for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Error type for the training orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// Session could not be set up; no step has run.
    #[error("Setup failed: {0}")]
    Setup(String),
    /// A step failed and the session cannot continue.
    #[error("Step {step} failed: {message}")]
    Step {
        /// 1-indexed failing step.
        step: usize,
        /// Underlying error.
        message: String,
    },
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Lifecycle transition not allowed from the current status.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: TrainingStatus,
        /// Requested status.
        to: TrainingStatus,
    },
    /// Steps can only run while the session is running.
    #[error("Session is {0}, not running")]
    NotRunning(TrainingStatus),
    /// A session is already running or paused.
    #[error("A training session is already {0}")]
    SessionActive(TrainingStatus),
    /// No session exists to receive the command.
    #[error("No training session")]
    NoSession,
    /// The worker task has exited.
    #[error("Training worker has shut down")]
    WorkerClosed,
    /// Adapter export failed.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainerError {
    pub(crate) fn step(step: usize, err: impl std::fmt::Display) -> Self {
        Self::Step {
            step,
            message: err.to_string(),
        }
    }

    pub(crate) fn at<E: std::fmt::Display>(step: usize) -> impl Fn(E) -> Self {
        move |err| Self::step(step, err)
    }

    pub(crate) fn setup(err: impl std::fmt::Display) -> Self {
        Self::Setup(err.to_string())
    }

    /// Failing step, for step errors.
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<LoraStepError> for TrainerError {
    fn from(err: LoraStepError) -> Self {
        let LoraStepError::Config(msg) = err;
        Self::Config(msg)
    }
}
