//! Top-k gating router.
//!
//! A linear gate scores every expert for every token. Each token keeps its
//! `k` highest raw scores (ties go to the lower expert index) and a softmax
//! over just those `k` scores gives its mixing weights, so a token's weights
//! always sum to one across exactly the experts it selected.

use ndarray::{Array2, ArrayBase, ArrayView1, Data, Ix2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::core::ops::Linear;
use crate::error::{CortexError, Result};

/// Gate weights: `W_gate ∈ R^{n_experts × d_model}` plus bias.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatingRouter {
    pub gate: Linear,
    top_k: usize,
}

impl GatingRouter {
    /// Zero gate. Fails if `top_k` is zero or exceeds `n_experts`.
    pub fn zeros(d_model: usize, n_experts: usize, top_k: usize) -> Result<Self> {
        check_top_k(n_experts, top_k)?;
        Ok(Self {
            gate: Linear::zeros(d_model, n_experts),
            top_k,
        })
    }

    pub fn init(d_model: usize, n_experts: usize, top_k: usize, rng: &mut StdRng) -> Result<Self> {
        check_top_k(n_experts, top_k)?;
        Ok(Self {
            gate: Linear::init(d_model, n_experts, rng),
            top_k,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn n_experts(&self) -> usize {
        self.gate.out_features()
    }

    /// Route token-major rows `[tokens, d_model]`.
    pub fn route<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix2>) -> GatingDecision {
        let scores = self.gate.forward(x);
        let n_tokens = scores.nrows();
        let mut indices = Vec::with_capacity(n_tokens * self.top_k);
        let mut weights = Vec::with_capacity(n_tokens * self.top_k);
        for row in scores.rows() {
            let (idx, w) = select_top_k(row, self.top_k);
            indices.extend(idx);
            weights.extend(w);
        }
        GatingDecision {
            n_experts: self.n_experts(),
            top_k: self.top_k,
            indices,
            weights,
        }
    }

    pub fn param_count(&self) -> usize {
        self.gate.param_count()
    }
}

fn check_top_k(n_experts: usize, top_k: usize) -> Result<()> {
    if top_k == 0 || top_k > n_experts {
        return Err(CortexError::BadConfig(format!(
            "top_k ({}) must lie in [1, n_experts = {}]",
            top_k, n_experts
        )));
    }
    Ok(())
}

/// Indices of the `k` largest scores, highest first, equal scores in
/// ascending index order, with their softmax-normalised weights.
pub fn select_top_k(scores: ArrayView1<f32>, k: usize) -> (Vec<usize>, Vec<f32>) {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // Stable sort keeps ascending index order among equal scores.
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);

    let max_score = order
        .iter()
        .map(|&i| scores[i])
        .fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = order.iter().map(|&i| (scores[i] - max_score).exp()).collect();
    let sum: f32 = exp.iter().sum();
    let weights = if sum > 0.0 && sum.is_finite() {
        exp.iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / order.len() as f32; order.len()]
    };
    (order, weights)
}

/// Per-token expert choices for one MoE evaluation.
#[derive(Clone, Debug)]
pub struct GatingDecision {
    pub n_experts: usize,
    pub top_k: usize,

    /// `[tokens * top_k]`, highest-scoring expert first per token.
    pub indices: Vec<usize>,

    /// `[tokens * top_k]`, aligned with `indices`.
    pub weights: Vec<f32>,
}

impl GatingDecision {
    pub fn n_tokens(&self) -> usize {
        if self.top_k == 0 {
            0
        } else {
            self.indices.len() / self.top_k
        }
    }

    /// `(expert, weight)` pairs chosen by `token`.
    pub fn experts_for(&self, token: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let range = token * self.top_k..(token + 1) * self.top_k;
        self.indices[range.clone()]
            .iter()
            .copied()
            .zip(self.weights[range].iter().copied())
    }

    /// Dense `[tokens, n_experts]` weight matrix; zero for unselected experts.
    pub fn dense_weights(&self) -> Array2<f32> {
        let mut dense = Array2::zeros((self.n_tokens(), self.n_experts));
        for token in 0..self.n_tokens() {
            for (expert, w) in self.experts_for(token) {
                dense[[token, expert]] = w;
            }
        }
        dense
    }

    /// For every expert, the `(token, weight)` pairs routed to it, in token
    /// order.
    pub fn partition(&self) -> Vec<Vec<(usize, f32)>> {
        let mut routed = vec![Vec::new(); self.n_experts];
        for token in 0..self.n_tokens() {
            for (expert, w) in self.experts_for(token) {
                routed[expert].push((token, w));
            }
        }
        routed
    }

    /// Number of token assignments per expert.
    pub fn expert_counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.n_experts];
        for &e in &self.indices {
            counts[e] += 1;
        }
        counts
    }

    /// Load balance summary over all assignments.
    pub fn load_balance_stats(&self) -> LoadBalanceStats {
        LoadBalanceStats::from_counts(self.expert_counts())
    }
}

/// Load balance statistics for routing decisions.
#[derive(Clone, Debug, Default)]
pub struct LoadBalanceStats {
    pub counts: Vec<u64>,
    pub mean: f64,
    pub variance: f64,
    pub max_count: u64,
    pub min_count: u64,
    /// 0 for a perfectly even spread, approaching 1 when one expert takes
    /// every assignment.
    pub gini: f64,
}

impl LoadBalanceStats {
    pub fn from_counts(counts: Vec<u64>) -> Self {
        let n = counts.len();
        if n == 0 {
            return Self::default();
        }
        let total: f64 = counts.iter().map(|&c| c as f64).sum();
        let mean = total / n as f64;

        let variance = counts
            .iter()
            .map(|&c| {
                let diff = c as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n as f64;

        let max_count = counts.iter().copied().max().unwrap_or(0);
        let min_count = counts.iter().copied().min().unwrap_or(0);

        let mut sorted: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let nf = n as f64;
        let gini = if total > 0.0 {
            let numerator: f64 = sorted
                .iter()
                .enumerate()
                .map(|(i, &x)| (2.0 * (i as f64 + 1.0) - nf - 1.0) * x)
                .sum();
            numerator / (nf * total)
        } else {
            0.0
        };

        Self {
            counts,
            mean,
            variance,
            max_count,
            min_count,
            gini,
        }
    }

    /// Experts that received no tokens.
    pub fn idle_experts(&self) -> usize {
        self.counts.iter().filter(|&&c| c == 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;

    #[test]
    fn test_top_k_above_experts_rejected() {
        let err = GatingRouter::zeros(8, 4, 5).unwrap_err();
        assert!(err.is_config_error());
        assert!(GatingRouter::zeros(8, 4, 0).is_err());
        assert!(GatingRouter::zeros(8, 4, 4).is_ok());
    }

    #[test]
    fn test_select_top_k_order_and_weights() {
        let scores = arr1(&[0.1, 2.0, -1.0, 1.0]);
        let (idx, w) = select_top_k(scores.view(), 2);
        assert_eq!(idx, vec![1, 3]);
        let e = (1.0f32).exp();
        assert!((w[0] - e / (e + 1.0)).abs() < 1e-6);
        assert!((w[0] + w[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let scores = arr1(&[0.5, 1.0, 1.0, 1.0]);
        let (idx, w) = select_top_k(scores.view(), 2);
        assert_eq!(idx, vec![1, 2]);
        assert!((w[0] - 0.5).abs() < 1e-6);

        let (idx, _) = select_top_k(arr1(&[0.0; 4]).view(), 3);
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn test_weights_sum_to_one_and_zero_elsewhere() {
        let mut rng = StdRng::seed_from_u64(4);
        let router = GatingRouter::init(6, 5, 2, &mut rng).unwrap();
        let x = ndarray::Array2::from_shape_fn((9, 6), |(i, j)| ((i * 7 + j * 3) % 5) as f32 - 2.0);
        let decision = router.route(&x);
        assert_eq!(decision.n_tokens(), 9);

        let dense = decision.dense_weights();
        for token in 0..9 {
            let row = dense.row(token);
            assert!((row.sum() - 1.0).abs() < 1e-5);
            let chosen: Vec<usize> = decision.experts_for(token).map(|(e, _)| e).collect();
            assert_eq!(chosen.len(), 2);
            assert_ne!(chosen[0], chosen[1]);
            for e in 0..5 {
                if !chosen.contains(&e) {
                    assert_eq!(row[e], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_partition_covers_every_assignment() {
        let mut router = GatingRouter::zeros(2, 3, 1).unwrap();
        router.gate.weight = arr2(&[[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]]);
        let x = arr2(&[[1.0, 0.0], [0.0, 1.0], [2.0, 0.0]]);
        let decision = router.route(&x);
        let parts = decision.partition();
        assert_eq!(parts[0], vec![(0, 1.0), (2, 1.0)]);
        assert_eq!(parts[1], vec![(1, 1.0)]);
        assert!(parts[2].is_empty());
        assert_eq!(decision.expert_counts(), vec![2, 1, 0]);
    }

    #[test]
    fn test_load_balance_even() {
        let stats = LoadBalanceStats::from_counts(vec![10, 10, 10, 10]);
        assert!(stats.gini.abs() < 1e-9);
        assert_eq!(stats.variance, 0.0);
        assert_eq!(stats.idle_experts(), 0);
    }

    #[test]
    fn test_load_balance_skewed() {
        let stats = LoadBalanceStats::from_counts(vec![40, 0, 0, 0]);
        assert!(stats.gini > 0.7, "gini = {}", stats.gini);
        assert_eq!(stats.max_count, 40);
        assert_eq!(stats.min_count, 0);
        assert_eq!(stats.idle_experts(), 3);
    }
}
