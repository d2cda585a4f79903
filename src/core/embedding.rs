//! Byte embedding: one learned vector per byte value, no tokenizer.

use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::config::VOCAB_SIZE;
use crate::error::{CortexError, Result};

/// Embedding table `[256, d_model]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ByteEmbedding {
    pub weight: Array2<f32>,
}

impl ByteEmbedding {
    pub fn zeros(d_model: usize) -> Self {
        Self {
            weight: Array2::zeros((VOCAB_SIZE, d_model)),
        }
    }

    /// Standard-normal initialisation.
    pub fn init(d_model: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Array2::from_shape_simple_fn((VOCAB_SIZE, d_model), || StandardNormal.sample(rng)),
        }
    }

    pub fn d_model(&self) -> usize {
        self.weight.ncols()
    }

    /// Look up `[batch, len]` byte ids, returning `[batch, len, d_model]`.
    ///
    /// Any id outside `[0, 255]` fails the whole lookup; nothing is clamped.
    pub fn forward(&self, ids: &Array2<u32>) -> Result<Array3<f32>> {
        let (batch, len) = ids.dim();
        let mut out = Array3::zeros((batch, len, self.d_model()));
        for ((b, t), &id) in ids.indexed_iter() {
            if id as usize >= VOCAB_SIZE {
                return Err(CortexError::ByteOutOfRange {
                    position: b * len + t,
                    value: id,
                });
            }
            out.slice_mut(s![b, t, ..])
                .assign(&self.weight.row(id as usize));
        }
        Ok(out)
    }

    pub fn param_count(&self) -> usize {
        self.weight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::SeedableRng;

    #[test]
    fn test_embedding_shape() {
        let emb = ByteEmbedding::zeros(8);
        let ids = Array2::<u32>::zeros((2, 5));
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.dim(), (2, 5, 8));
    }

    #[test]
    fn test_extreme_bytes_distinct_and_deterministic() {
        let mut rng = StdRng::seed_from_u64(11);
        let emb = ByteEmbedding::init(16, &mut rng);
        let ids = arr2(&[[0u32, 255]]);
        let a = emb.forward(&ids).unwrap();
        let b = emb.forward(&ids).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.slice(s![0, 0, ..]), a.slice(s![0, 1, ..]));
    }

    #[test]
    fn test_same_seed_same_table() {
        let a = ByteEmbedding::init(4, &mut StdRng::seed_from_u64(5));
        let b = ByteEmbedding::init(4, &mut StdRng::seed_from_u64(5));
        assert_eq!(a.weight, b.weight);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let emb = ByteEmbedding::zeros(4);
        let ids = arr2(&[[1u32, 2], [256, 3]]);
        match emb.forward(&ids) {
            Err(CortexError::ByteOutOfRange { position, value }) => {
                assert_eq!(position, 2);
                assert_eq!(value, 256);
            }
            other => panic!("expected ByteOutOfRange, got {:?}", other.map(|a| a.dim())),
        }
    }
}
