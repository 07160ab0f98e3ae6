//! Fixed-length sequence windows and cyclic batch indexing.

use tracing::info;

use crate::error::{DataError, Result};

/// A token stream cut into fixed-length windows.
///
/// Window `i` starts at `i * stride`. `stride == seq_len` gives disjoint
/// windows; a smaller stride makes neighbours overlap. A trailing remainder
/// shorter than `seq_len` is dropped.
#[derive(Debug, Clone)]
pub struct SequenceWindows {
    tokens: Vec<u32>,
    seq_len: usize,
    stride: usize,
    num_windows: usize,
}

impl SequenceWindows {
    /// Window `tokens`.
    pub fn new(tokens: Vec<u32>, seq_len: usize, stride: usize) -> Result<Self> {
        if seq_len < 2 {
            return Err(DataError::Config(format!(
                "sequence length must be >= 2, got {seq_len}"
            )));
        }
        if stride == 0 || stride > seq_len {
            return Err(DataError::Config(format!(
                "stride must be in 1..={seq_len}, got {stride}"
            )));
        }
        if tokens.len() < seq_len {
            return Err(DataError::InsufficientTokens {
                available: tokens.len(),
                required: seq_len,
            });
        }
        let num_windows = (tokens.len() - seq_len) / stride + 1;
        info!(
            tokens = tokens.len(),
            seq_len,
            stride,
            windows = num_windows,
            "Windowed dataset"
        );
        Ok(Self {
            tokens,
            seq_len,
            stride,
            num_windows,
        })
    }

    /// Number of windows.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_windows
    }

    /// Always false once constructed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_windows == 0
    }

    /// Tokens per window.
    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Offset between window starts.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Length of the underlying token stream.
    pub fn total_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Window `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<&[u32]> {
        (index < self.num_windows).then(|| {
            let start = index * self.stride;
            &self.tokens[start..start + self.seq_len]
        })
    }

    /// Concatenate the windows at `indices` into one `[batch, seq_len]` batch.
    pub fn gather(&self, indices: &[usize]) -> Result<Batch> {
        let mut input_ids = Vec::with_capacity(indices.len() * self.seq_len);
        for &index in indices {
            let window = self.get(index).ok_or_else(|| {
                DataError::Config(format!(
                    "window {index} out of range for {} windows",
                    self.num_windows
                ))
            })?;
            input_ids.extend_from_slice(window);
        }
        Ok(Batch {
            input_ids,
            batch_size: indices.len(),
            seq_len: self.seq_len,
            indices: indices.to_vec(),
        })
    }
}

/// One training batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Row-major `[batch_size, seq_len]` token ids.
    pub input_ids: Vec<u32>,
    /// Sequences in the batch.
    pub batch_size: usize,
    /// Tokens per sequence.
    pub seq_len: usize,
    /// Window indices the batch was drawn from.
    pub indices: Vec<usize>,
}

impl Batch {
    /// Total tokens in the batch.
    pub fn num_tokens(&self) -> usize {
        self.input_ids.len()
    }
}

/// Cyclic batch cursor.
///
/// Batch `i` holds windows `(i * batch_size + j) % num_windows` for
/// `j < batch_size`, so the schedule wraps around the dataset and depends
/// only on the batch index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCursor {
    num_windows: usize,
    batch_size: usize,
    position: usize,
}

impl BatchCursor {
    /// Create a cursor at batch 0.
    pub fn new(num_windows: usize, batch_size: usize) -> Result<Self> {
        if num_windows == 0 || batch_size == 0 {
            return Err(DataError::Config(format!(
                "cursor needs windows and batch size > 0, got {num_windows} and {batch_size}"
            )));
        }
        Ok(Self {
            num_windows,
            batch_size,
            position: 0,
        })
    }

    /// Window indices of batch `batch_index`.
    pub fn indices_for(&self, batch_index: usize) -> Vec<usize> {
        (0..self.batch_size)
            .map(|j| (batch_index * self.batch_size + j) % self.num_windows)
            .collect()
    }

    /// Indices of the next batch, without advancing.
    pub fn peek(&self) -> Vec<usize> {
        self.indices_for(self.position)
    }

    /// Indices of the next batch; advances the cursor.
    pub fn next_indices(&mut self) -> Vec<usize> {
        let indices = self.peek();
        self.position += 1;
        indices
    }

    /// Batches drawn so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_windows() {
        let windows = SequenceWindows::new((0..10).collect(), 4, 4).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows.get(0), Some(&[0, 1, 2, 3][..]));
        assert_eq!(windows.get(1), Some(&[4, 5, 6, 7][..]));
        assert_eq!(windows.get(2), None);
    }

    #[test]
    fn test_overlapping_windows() {
        let windows = SequenceWindows::new((0..10).collect(), 4, 2).unwrap();
        assert_eq!(windows.len(), 4);
        assert_eq!(windows.get(3), Some(&[6, 7, 8, 9][..]));
    }

    #[test]
    fn test_short_corpus_rejected() {
        assert!(matches!(
            SequenceWindows::new(vec![1, 2], 4, 4),
            Err(DataError::InsufficientTokens { available: 2, required: 4 })
        ));
        assert!(SequenceWindows::new(vec![1; 8], 4, 5).is_err());
    }

    #[test]
    fn test_cursor_wraps() {
        let mut cursor = BatchCursor::new(5, 2).unwrap();
        assert_eq!(cursor.next_indices(), vec![0, 1]);
        assert_eq!(cursor.next_indices(), vec![2, 3]);
        assert_eq!(cursor.next_indices(), vec![4, 0]);
        assert_eq!(cursor.position(), 3);
        assert_eq!(cursor.peek(), cursor.indices_for(3));
    }

    #[test]
    fn test_gather() {
        let windows = SequenceWindows::new((0..12).collect(), 4, 4).unwrap();
        let batch = windows.gather(&[2, 0]).unwrap();
        assert_eq!(batch.input_ids, vec![8, 9, 10, 11, 0, 1, 2, 3]);
        assert_eq!(batch.num_tokens(), 8);
        assert!(windows.gather(&[3]).is_err());
    }
}
