//! Dataset preparation for lorastep.
//!
//! This crate provides:
//! - The [`Tokenizer`] trait with a byte-level and a `tokenizers`-backed implementation
//! - [`DatasetSource`] for text, text files and pre-tokenized corpora
//! - [`SequenceWindows`] and the cyclic [`BatchCursor`]

#![warn(missing_docs)]

pub mod dataloader;
pub mod dataset;
mod error;
pub mod tokenizer;

pub use dataloader::*;
pub use dataset::*;
pub use error::{DataError, Result};
pub use tokenizer::*;
