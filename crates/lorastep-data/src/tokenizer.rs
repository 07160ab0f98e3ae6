//! Tokenizer integration.

use std::path::Path;

use crate::error::{DataError, Result};

/// Text to token id conversion.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Vocabulary size; every id produced by `encode` is below it.
    fn vocab_size(&self) -> usize;

    /// End-of-sequence id, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32> {
        None
    }
}

/// Byte-level tokenizer: one token per UTF-8 byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// Fixed vocabulary size.
    pub const VOCAB_SIZE: usize = 256;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id).map_err(|_| DataError::TokenOutOfRange {
                    id,
                    vocab_size: Self::VOCAB_SIZE,
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

/// Wrapper around the tokenizers library.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a local `tokenizer.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| DataError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Load a tokenizer from serialized JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| DataError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Get the underlying tokenizer.
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| DataError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| DataError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("</s>")
            .or_else(|| self.inner.token_to_id("<|endoftext|>"))
            .or_else(|| self.inner.token_to_id("<|end_of_text|>"))
            .or_else(|| self.inner.token_to_id("<eos>"))
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"hello": 0, "world": 1, "[UNK]": 2},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn test_byte_tokenizer_roundtrip() {
        let tok = ByteTokenizer;
        let ids = tok.encode("héllo").unwrap();
        assert_eq!(ids.len(), 6);
        assert!(ids.iter().all(|&id| (id as usize) < tok.vocab_size()));
        assert_eq!(tok.decode(&ids).unwrap(), "héllo");
    }

    #[test]
    fn test_byte_tokenizer_rejects_large_ids() {
        assert!(matches!(
            ByteTokenizer.decode(&[300]),
            Err(DataError::TokenOutOfRange { id: 300, .. })
        ));
    }

    #[test]
    fn test_hf_tokenizer_from_bytes() {
        let tok = HfTokenizer::from_bytes(WORD_LEVEL.as_bytes()).unwrap();
        assert_eq!(tok.vocab_size(), 3);
        assert_eq!(tok.encode("hello world again").unwrap(), vec![0, 1, 2]);
        assert_eq!(tok.eos_token_id(), None);
    }

    #[test]
    fn test_hf_tokenizer_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = HfTokenizer::from_file(dir.path().join("tokenizer.json"));
        assert!(matches!(result, Err(DataError::Tokenizer(_))));
    }
}
