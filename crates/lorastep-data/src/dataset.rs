//! Training corpus sources.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DataError, Result};
use crate::tokenizer::Tokenizer;

/// Where the training corpus comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    /// Cleaned text, tokenized at initialization.
    Text {
        /// Corpus text.
        text: String,
    },
    /// UTF-8 text file, tokenized at initialization.
    TextFile {
        /// Path to the file.
        path: PathBuf,
    },
    /// Pre-tokenized ids.
    Tokens {
        /// Token ids.
        ids: Vec<u32>,
    },
}

impl DatasetSource {
    /// Produce the token stream, checking every id against the vocabulary.
    pub fn load_tokens(&self, tokenizer: &dyn Tokenizer) -> Result<Vec<u32>> {
        let ids = match self {
            Self::Text { text } => tokenizer.encode(text)?,
            Self::TextFile { path } => tokenizer.encode(&std::fs::read_to_string(path)?)?,
            Self::Tokens { ids } => ids.clone(),
        };
        let vocab_size = tokenizer.vocab_size();
        if let Some(&id) = ids.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(DataError::TokenOutOfRange { id, vocab_size });
        }
        debug!(tokens = ids.len(), "Loaded dataset");
        Ok(ids)
    }
}
