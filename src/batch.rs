//! Building `[batch, len]` byte-id tensors from raw bytes.

use ndarray::Array2;

use crate::error::{CortexError, Result};

/// Input ids and optional next-byte targets, both `[batch, len]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ByteBatch {
    pub inputs: Array2<u32>,
    pub targets: Option<Array2<u32>>,
}

impl ByteBatch {
    /// Stack equal-length sequences into one batch without targets.
    pub fn from_sequences(sequences: &[Vec<u8>]) -> Result<Self> {
        let expected = match sequences.first() {
            Some(first) if !first.is_empty() => first.len(),
            _ => return Err(CortexError::EmptyBatch),
        };
        if let Some((index, seq)) = sequences
            .iter()
            .enumerate()
            .find(|(_, seq)| seq.len() != expected)
        {
            return Err(CortexError::RaggedBatch {
                index,
                len: seq.len(),
                expected,
            });
        }

        let inputs = Array2::from_shape_fn((sequences.len(), expected), |(b, t)| {
            sequences[b][t] as u32
        });
        Ok(Self {
            inputs,
            targets: None,
        })
    }

    /// `batch_size` consecutive windows of `corpus` starting at `offset`,
    /// each target window shifted one byte ahead of its input.
    ///
    /// Window `i` starts at `(offset + i * seq_len) mod (corpus.len() - seq_len)`
    /// so a small corpus wraps around instead of running out.
    pub fn next_byte_windows(
        corpus: &[u8],
        seq_len: usize,
        batch_size: usize,
        offset: usize,
    ) -> Result<Self> {
        if seq_len == 0 || batch_size == 0 {
            return Err(CortexError::EmptyBatch);
        }
        if corpus.len() < seq_len + 1 {
            return Err(CortexError::ShapeMismatch {
                expected: format!("corpus of at least {} bytes", seq_len + 1),
                got: format!("{} bytes", corpus.len()),
            });
        }

        let span = corpus.len() - seq_len;
        let starts: Vec<usize> = (0..batch_size)
            .map(|i| (offset + i * seq_len) % span)
            .collect();
        let inputs = Array2::from_shape_fn((batch_size, seq_len), |(b, t)| {
            corpus[starts[b] + t] as u32
        });
        let targets = Array2::from_shape_fn((batch_size, seq_len), |(b, t)| {
            corpus[starts[b] + t + 1] as u32
        });
        Ok(Self {
            inputs,
            targets: Some(targets),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.inputs.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_from_sequences() {
        let batch = ByteBatch::from_sequences(&[b"abc".to_vec(), vec![0, 1, 255]]).unwrap();
        assert_eq!(batch.inputs, arr2(&[[97, 98, 99], [0, 1, 255]]));
        assert!(batch.targets.is_none());
        assert_eq!((batch.batch_size(), batch.seq_len()), (2, 3));
    }

    #[test]
    fn test_ragged_rejected() {
        let err = ByteBatch::from_sequences(&[vec![1, 2, 3], vec![4, 5]]).unwrap_err();
        assert!(matches!(
            err,
            CortexError::RaggedBatch {
                index: 1,
                len: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(ByteBatch::from_sequences(&[]), Err(CortexError::EmptyBatch)));
        assert!(matches!(
            ByteBatch::from_sequences(&[vec![]]),
            Err(CortexError::EmptyBatch)
        ));
    }

    #[test]
    fn test_windows_shift_targets() {
        let corpus: Vec<u8> = (0..20).collect();
        let batch = ByteBatch::next_byte_windows(&corpus, 4, 3, 0).unwrap();
        assert_eq!(batch.inputs, arr2(&[[0, 1, 2, 3], [4, 5, 6, 7], [8, 9, 10, 11]]));
        let targets = batch.targets.unwrap();
        assert_eq!(targets.row(0).to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(targets.row(2).to_vec(), vec![9, 10, 11, 12]);
    }

    #[test]
    fn test_windows_wrap() {
        let corpus: Vec<u8> = (0..6).collect();
        let batch = ByteBatch::next_byte_windows(&corpus, 3, 2, 2).unwrap();
        // span = 3: starts at 2 and (2 + 3) % 3 = 2.
        assert_eq!(batch.inputs, arr2(&[[2, 3, 4], [2, 3, 4]]));
        assert_eq!(batch.targets.unwrap().row(1).to_vec(), vec![3, 4, 5]);
    }

    #[test]
    fn test_short_corpus_rejected() {
        let err = ByteBatch::next_byte_windows(b"abcd", 4, 1, 0).unwrap_err();
        assert!(err.is_input_error());
        assert!(ByteBatch::next_byte_windows(b"abcde", 4, 1, 0).is_ok());
    }
}
