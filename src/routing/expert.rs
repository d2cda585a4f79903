//! Expert feed-forward network: `d → ffn_mult·d → d` with GELU.

use ndarray::{Array2, ArrayBase, Data, Ix2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::ops::{gelu, Dropout, Linear};

/// A single specialist. Stateless between calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpertNetwork {
    pub up: Linear,
    pub down: Linear,
    pub dropout: Dropout,
}

impl ExpertNetwork {
    pub fn zeros(config: &Config) -> Self {
        Self {
            up: Linear::zeros(config.d_model, config.d_ff()),
            down: Linear::zeros(config.d_ff(), config.d_model),
            dropout: Dropout::new(config.dropout),
        }
    }

    pub fn init(config: &Config, rng: &mut StdRng) -> Self {
        Self {
            up: Linear::init(config.d_model, config.d_ff(), rng),
            down: Linear::init(config.d_ff(), config.d_model, rng),
            dropout: Dropout::new(config.dropout),
        }
    }

    /// `[tokens, d] → [tokens, d]`; dropout on the output when `rng` is given.
    pub fn forward<S: Data<Elem = f32>>(
        &self,
        x: &ArrayBase<S, Ix2>,
        rng: Option<&mut StdRng>,
    ) -> Array2<f32> {
        let hidden = self.up.forward(x).mapv(gelu);
        let mut out = self.down.forward(&hidden);
        self.dropout.apply(&mut out, rng);
        out
    }

    pub fn param_count(&self) -> usize {
        self.up.param_count() + self.down.param_count()
    }
}
