//! Base models for lorastep.
//!
//! The trainer only needs a frozen model that produces logits, lets the
//! adapter hook into its linear layers, and maps a logit gradient back to its
//! final hidden state. [`BaseModel`] captures that contract; [`TinyLm`] is a
//! small reference implementation with packed 4-bit projections.

#![warn(missing_docs)]

mod error;
pub mod tiny;
pub mod traits;

pub use error::{ModelError, Result};
pub use tiny::{TinyLm, TinyLmConfig, TinyLmProvider, PROJECTIONS};
pub use traits::*;
