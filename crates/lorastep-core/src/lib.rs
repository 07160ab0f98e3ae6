//! Core types, traits, and configuration for lorastep LoRA training.
//!
//! This crate provides the foundational abstractions used throughout the
//! lorastep workspace, including:
//!
//! - Configuration types for the adapter, optimizer, rank scheduler and training run
//! - Common type definitions (training status, memory statistics, step metrics)
//! - Callback and hardware-estimator traits
//! - Error handling infrastructure
//! - Learning rate schedulers

#![warn(missing_docs)]

mod config;
mod error;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::LearningRateScheduler;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{LoraStepError, Result};
    pub use crate::scheduler::LearningRateScheduler;
    pub use crate::traits::*;
    pub use crate::types::*;
}
