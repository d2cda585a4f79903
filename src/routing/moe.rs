//! Sparse Mixture-of-Experts layer.
//!
//! Dispatch is index based:
//! 1. the router assigns every token its top-k experts;
//! 2. assignments are partitioned into one `(token, weight)` list per expert;
//! 3. each expert runs only on the rows gathered from its own list, and
//!    experts run in parallel since no two share mutable state;
//! 4. outputs are scattered back, scaled by gate weight, onto a copy of the
//!    input (the residual), visiting experts in index order.
//!
//! There is no capacity limit: every assignment is served. An expert with an
//! empty list is skipped.

use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::ops::{flatten_tokens, unflatten_tokens};
use crate::error::Result;

use super::expert::ExpertNetwork;
use super::router::{GatingDecision, GatingRouter};

/// Router plus expert pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoELayer {
    pub router: GatingRouter,
    pub experts: Vec<ExpertNetwork>,
}

impl MoELayer {
    pub fn zeros(config: &Config) -> Result<Self> {
        Ok(Self {
            router: GatingRouter::zeros(config.d_model, config.n_experts, config.top_k)?,
            experts: (0..config.n_experts)
                .map(|_| ExpertNetwork::zeros(config))
                .collect(),
        })
    }

    pub fn init(config: &Config, rng: &mut StdRng) -> Result<Self> {
        let router = GatingRouter::init(config.d_model, config.n_experts, config.top_k, rng)?;
        let experts = (0..config.n_experts)
            .map(|_| ExpertNetwork::init(config, rng))
            .collect();
        Ok(Self { router, experts })
    }

    /// `[batch, len, d] → [batch, len, d]`.
    pub fn forward(&self, x: &Array3<f32>, rng: Option<&mut StdRng>) -> Result<Array3<f32>> {
        self.forward_with_decision(x, rng).map(|(y, _)| y)
    }

    /// Like [`MoELayer::forward`], also returning the gating decision
    /// (tokens in row-major `(batch, position)` order).
    pub fn forward_with_decision(
        &self,
        x: &Array3<f32>,
        rng: Option<&mut StdRng>,
    ) -> Result<(Array3<f32>, GatingDecision)> {
        let (batch, len, _) = x.dim();
        let flat = flatten_tokens(x)?;
        let decision = self.router.route(&flat);
        let routed = decision.partition();

        // One seed per expert, drawn in expert order, keeps training-mode
        // dropout reproducible regardless of thread scheduling.
        let seeds: Vec<Option<u64>> = match rng {
            Some(rng) => self.experts.iter().map(|_| Some(rng.gen())).collect(),
            None => vec![None; self.experts.len()],
        };

        let outputs: Vec<Option<Array2<f32>>> = self
            .experts
            .par_iter()
            .zip(routed.par_iter())
            .zip(seeds.par_iter())
            .map(|((expert, assignments), seed)| {
                if assignments.is_empty() {
                    return None;
                }
                let tokens: Vec<usize> = assignments.iter().map(|&(t, _)| t).collect();
                let subset = flat.select(Axis(0), &tokens);
                let mut expert_rng = seed.map(StdRng::seed_from_u64);
                Some(expert.forward(&subset, expert_rng.as_mut()))
            })
            .collect();

        let mut acc = flat.into_owned();
        for (assignments, out) in routed.iter().zip(&outputs) {
            let Some(out) = out else { continue };
            for (row, &(token, weight)) in out.rows().into_iter().zip(assignments) {
                acc.row_mut(token).scaled_add(weight, &row);
            }
        }

        let stats = decision.load_balance_stats();
        tracing::trace!(
            tokens = decision.n_tokens(),
            idle_experts = stats.idle_experts(),
            gini = stats.gini,
            "moe dispatch"
        );

        Ok((unflatten_tokens(acc, batch, len)?, decision))
    }

    pub fn param_count(&self) -> usize {
        self.router.param_count() + self.experts.iter().map(|e| e.param_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn random_input(batch: usize, len: usize, d: usize, seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array3::from_shape_simple_fn((batch, len, d), || rng.gen_range(-1.0f32..1.0))
    }

    #[test]
    fn test_shape_preserved() {
        let cfg = Config::tiny();
        let moe = MoELayer::init(&cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        let x = random_input(2, 5, cfg.d_model, 1);
        assert_eq!(moe.forward(&x, None).unwrap().dim(), (2, 5, cfg.d_model));
    }

    #[test]
    fn test_rejects_top_k_above_experts() {
        let cfg = Config {
            top_k: 3,
            n_experts: 2,
            ..Config::tiny()
        };
        assert!(MoELayer::zeros(&cfg).unwrap_err().is_config_error());
    }

    #[test]
    fn test_zero_experts_pass_input_through() {
        let cfg = Config::tiny();
        let moe = MoELayer::zeros(&cfg).unwrap();
        let x = random_input(1, 3, cfg.d_model, 2);
        assert_eq!(moe.forward(&x, None).unwrap(), x);
    }

    #[test]
    fn test_weighted_recombination() {
        let cfg = Config::tiny();
        let moe = MoELayer::init(&cfg, &mut StdRng::seed_from_u64(3)).unwrap();
        let x = random_input(2, 4, cfg.d_model, 4);
        let (y, decision) = moe.forward_with_decision(&x, None).unwrap();

        let flat = x.to_shape((8, cfg.d_model)).unwrap();
        for token in 0..8 {
            let input = flat.slice(s![token..token + 1, ..]);
            let mut expected = input.row(0).to_owned();
            for (e, w) in decision.experts_for(token) {
                let out = moe.experts[e].forward(&input, None);
                expected.scaled_add(w, &out.row(0));
            }
            let got = y.slice(s![token / 4, token % 4, ..]);
            for (a, b) in got.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4, "token {}: {} vs {}", token, a, b);
            }
        }
    }

    #[test]
    fn test_idle_expert_is_harmless() {
        let cfg = Config::tiny();
        let mut moe = MoELayer::init(&cfg, &mut StdRng::seed_from_u64(5)).unwrap();
        // Bias the gate so experts 0 and 1 win every token.
        moe.router.gate.weight.fill(0.0);
        moe.router.gate.bias = ndarray::arr1(&[2.0, 1.0, -1.0, -2.0]);

        let x = random_input(2, 3, cfg.d_model, 6);
        let (y, decision) = moe.forward_with_decision(&x, None).unwrap();
        assert_eq!(decision.expert_counts(), vec![6, 6, 0, 0]);

        let mut altered = moe.clone();
        altered.experts[2].up.weight.fill(100.0);
        altered.experts[3].down.bias.fill(-50.0);
        assert_eq!(altered.forward(&x, None).unwrap(), y);
    }

    #[test]
    fn test_eval_deterministic() {
        let cfg = Config::tiny();
        let moe = MoELayer::init(&cfg, &mut StdRng::seed_from_u64(7)).unwrap();
        let x = random_input(3, 6, cfg.d_model, 8);
        assert_eq!(moe.forward(&x, None).unwrap(), moe.forward(&x, None).unwrap());
    }

    #[test]
    fn test_train_dropout_reproducible_per_seed() {
        let cfg = Config {
            dropout: 0.5,
            ..Config::tiny()
        };
        let moe = MoELayer::init(&cfg, &mut StdRng::seed_from_u64(9)).unwrap();
        let x = random_input(2, 4, cfg.d_model, 10);
        let a = moe.forward(&x, Some(&mut StdRng::seed_from_u64(1))).unwrap();
        let b = moe.forward(&x, Some(&mut StdRng::seed_from_u64(1))).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, moe.forward(&x, None).unwrap());
    }
}
