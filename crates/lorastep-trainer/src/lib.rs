//! Training orchestration for lorastep.
//!
//! - [`TrainingSession`]: lifecycle state machine and the per-step pipeline
//!   (forward with the LoRA branch, loss, LoRA backward, clipping, 8-bit Adam)
//! - [`RankScheduler`]: recommends adapter rank changes between steps
//! - [`Worker`]: runs one session in the background and speaks the
//!   [`HostMessage`]/[`WorkerMessage`] protocol over tokio channels
//! - callbacks for logging, JSONL metrics and in-memory history
//!
//! # Example
//!
//! ```ignore
//! use lorastep_trainer::{HostMessage, SessionResources, spawn_worker};
//!
//! let mut worker = spawn_worker(SessionResources::reference(ctx));
//! worker.send(HostMessage::InitializeAndStart(request))?;
//! while let Some(event) = worker.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

#![warn(missing_docs)]

pub mod callbacks;
mod error;
pub mod progress;
pub mod protocol;
pub mod rank_scheduler;
pub mod session;
mod state;
pub mod worker;

pub use callbacks::{HistoryCallback, LoggingCallback, MetricsJsonCallback};
pub use error::{Result, TrainerError};
pub use progress::{estimate_eta, should_report};
pub use protocol::{
    CompletionReport, HostMessage, ProgressUpdate, StatusSnapshot, TrainingRequest, WorkerMessage,
};
pub use rank_scheduler::{RankChange, RankDecision, RankScheduler, RankSchedulerStats};
pub use session::{SessionResources, StepOutcome, TrainingSession};
pub use state::TrainingState;
pub use worker::{spawn_worker, CallbackFactory, Worker, WorkerHandle};
