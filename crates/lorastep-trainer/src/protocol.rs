//! Host/worker control protocol.
//!
//! Messages are internally tagged by `type` with SCREAMING_SNAKE_CASE names
//! and camelCase fields, e.g. `{"type":"TRAINING_PAUSED","step":12}`.
//!
//! Embedded [`TrainingConfig`], [`ModelSource`] and [`DatasetSource`] values
//! keep the snake_case field names they use in configuration files, so a
//! config section can be pasted into a request unchanged:
//!
//! ```json
//! {"type":"INITIALIZE_AND_START","modelSource":{"kind":"tiny","hidden_size":16},
//!  "dataset":{"kind":"text","text":"hello"},"trainingConfig":{"max_steps":5}}
//! ```

use lorastep_core::{TrainingConfig, TrainingStatus};
use lorastep_data::DatasetSource;
use lorastep_lora::AdapterData;
use lorastep_models::ModelSource;
use serde::{Deserialize, Serialize};

use crate::rank_scheduler::{RankDecision, RankSchedulerStats};

/// Everything needed to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequest {
    /// Base model to adapt.
    pub model_source: ModelSource,
    /// Training corpus.
    pub dataset: DatasetSource,
    /// Hyperparameters.
    #[serde(default)]
    pub training_config: TrainingConfig,
}

/// Host to worker commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    /// Start a new session; rejected while one is running or paused.
    InitializeAndStart(TrainingRequest),
    /// Suspend at the next step boundary.
    PauseTraining,
    /// Continue a paused session.
    ResumeTraining,
    /// Abort the session and release its buffers.
    StopTraining,
    /// Request a [`WorkerMessage::StatusUpdate`].
    GetStatus,
}

/// Progress report for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Completed step.
    pub step: usize,
    /// Steps in the session.
    pub total_steps: usize,
    /// `step / total_steps`.
    pub progress: f64,
    /// Loss of this step.
    pub loss: f64,
    /// Mean loss so far.
    pub average_loss: f64,
    /// Tokens per second of this step.
    pub throughput: f64,
    /// Estimated seconds remaining.
    pub eta: Option<f64>,
    /// Device memory in use, in GB.
    pub memory_usage: f64,
    /// Adapter rank after this step.
    pub current_rank: usize,
    /// Learning rate applied this step.
    pub learning_rate: f64,
    /// Rank scheduler decision for this step.
    pub rank_decision: Option<RankDecision>,
}

/// Final report of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// Steps executed.
    pub total_steps: usize,
    /// Loss of the last step.
    pub final_loss: Option<f64>,
    /// Mean loss over the session.
    pub average_loss: Option<f64>,
    /// Mean tokens per second over the session.
    pub average_throughput: Option<f64>,
    /// Seconds spent executing steps.
    pub training_time: f64,
    /// Rank scheduler summary.
    pub rank_scheduler_stats: RankSchedulerStats,
    /// Trained adapter.
    pub adapter_data: AdapterData,
}

/// Snapshot answered to [`HostMessage::GetStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// A session is running or paused.
    pub is_training: bool,
    /// The session is paused.
    pub is_paused: bool,
    /// Lifecycle status.
    pub status: TrainingStatus,
    /// Completed steps.
    pub current_step: usize,
    /// Steps in the session.
    pub total_steps: usize,
    /// `current_step / total_steps`.
    pub progress: f64,
    /// Loss of the latest step.
    pub current_loss: Option<f64>,
    /// Device memory in use, in GB.
    pub memory_usage: f64,
    /// Estimated seconds remaining.
    pub eta: Option<f64>,
    /// Adapter rank, when a session exists.
    pub current_rank: Option<usize>,
}

impl StatusSnapshot {
    /// Snapshot with no session.
    pub fn idle(status: TrainingStatus) -> Self {
        Self {
            is_training: false,
            is_paused: false,
            status,
            current_step: 0,
            total_steps: 0,
            progress: 0.0,
            current_loss: None,
            memory_usage: 0.0,
            eta: None,
            current_rank: None,
        }
    }
}

/// Worker to host events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Session initialized and running.
    #[serde(rename_all = "camelCase")]
    TrainingStarted {
        /// Steps the session will run.
        total_steps: usize,
        /// Training sequences after windowing.
        dataset_size: usize,
        /// Tokens in the corpus.
        dataset_tokens: usize,
        /// Effective configuration.
        config: TrainingConfig,
    },
    /// Periodic step report.
    TrainingProgress(ProgressUpdate),
    /// Session suspended after `step`.
    TrainingPaused {
        /// Last completed step.
        step: usize,
    },
    /// Session continuing after `step`.
    TrainingResumed {
        /// Last completed step.
        step: usize,
    },
    /// Session aborted and buffers released.
    TrainingStopped {
        /// Last completed step.
        step: usize,
    },
    /// Adapter reallocated at a new rank.
    #[serde(rename_all = "camelCase")]
    RankUpdated {
        /// Rank before.
        old_rank: usize,
        /// Rank after.
        new_rank: usize,
        /// Step of the change.
        step: usize,
    },
    /// Session finished; carries the trained adapter.
    TrainingCompleted(Box<CompletionReport>),
    /// Something failed or a command was rejected.
    Error {
        /// Description.
        message: String,
        /// Failing step, for step errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
    },
    /// Answer to [`HostMessage::GetStatus`].
    StatusUpdate(StatusSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_message_tags() {
        let msg: HostMessage = serde_json::from_str(r#"{"type":"PAUSE_TRAINING"}"#).unwrap();
        assert_eq!(msg, HostMessage::PauseTraining);

        let json = r#"{
            "type": "INITIALIZE_AND_START",
            "modelSource": {"kind": "tiny", "hidden_size": 16},
            "dataset": {"kind": "text", "text": "hello"},
            "trainingConfig": {"max_steps": 5}
        }"#;
        let HostMessage::InitializeAndStart(request) = serde_json::from_str(json).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(request.training_config.max_steps, 5);
        assert_eq!(request.model_source.name(), "tiny-lm");
    }

    #[test]
    fn test_worker_message_shape() {
        let value = serde_json::to_value(WorkerMessage::RankUpdated {
            old_rank: 8,
            new_rank: 6,
            step: 40,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "RANK_UPDATED", "oldRank": 8, "newRank": 6, "step": 40})
        );

        let value = serde_json::to_value(WorkerMessage::Error {
            message: "boom".into(),
            step: None,
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"type": "ERROR", "message": "boom"}));
    }

    #[test]
    fn test_embedded_config_keeps_snake_case() {
        let value = serde_json::to_value(WorkerMessage::TrainingStarted {
            total_steps: 5,
            dataset_size: 3,
            dataset_tokens: 96,
            config: TrainingConfig {
                max_steps: 5,
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(value["totalSteps"], 5);
        assert_eq!(value["datasetTokens"], 96);
        assert_eq!(value["config"]["max_steps"], 5);
        assert!(value["config"].get("maxSteps").is_none());
        assert!(value["config"]["adapter"].get("target_modules").is_some());
    }

    #[test]
    fn test_status_update_fields() {
        let value =
            serde_json::to_value(WorkerMessage::StatusUpdate(StatusSnapshot::idle(TrainingStatus::Idle)))
                .unwrap();
        assert_eq!(value["type"], "STATUS_UPDATE");
        assert_eq!(value["isTraining"], false);
        assert_eq!(value["status"], "idle");
    }
}
