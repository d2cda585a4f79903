//! Attention ("reasoning") block: multi-head self-attention over the whole
//! sequence followed by a position-wise feed-forward sublayer.
//!
//! Post-norm layout, each sublayer with its own residual:
//!
//! ```text
//! h   = LN1(x + Dropout(MHA(x)))
//! out = LN2(h + Dropout(W2 · Dropout(relu(W1 · h))))
//! ```
//!
//! Unlike the state-space block, this block returns the updated stream, not
//! a delta.

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;

use super::ops::{relu, softmax_in_place, Dropout, LayerNorm, Linear};

/// Weights for a single attention block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttentionBlock {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    pub norm1: LayerNorm,
    pub ff_up: Linear,
    pub ff_down: Linear,
    pub norm2: LayerNorm,
    pub dropout: Dropout,
    pub n_heads: usize,

    /// Mask keys after the query position.
    pub causal: bool,
}

impl AttentionBlock {
    pub fn zeros(config: &Config) -> Self {
        let d = config.d_model;
        Self {
            w_q: Linear::zeros(d, d),
            w_k: Linear::zeros(d, d),
            w_v: Linear::zeros(d, d),
            w_o: Linear::zeros(d, d),
            norm1: LayerNorm::new(d, config.norm_eps),
            ff_up: Linear::zeros(d, config.d_ff()),
            ff_down: Linear::zeros(config.d_ff(), d),
            norm2: LayerNorm::new(d, config.norm_eps),
            dropout: Dropout::new(config.dropout),
            n_heads: config.n_heads,
            causal: config.causal_attention,
        }
    }

    pub fn init(config: &Config, rng: &mut StdRng) -> Self {
        let d = config.d_model;
        Self {
            w_q: Linear::init(d, d, rng),
            w_k: Linear::init(d, d, rng),
            w_v: Linear::init(d, d, rng),
            w_o: Linear::init(d, d, rng),
            ff_up: Linear::init(d, config.d_ff(), rng),
            ff_down: Linear::init(config.d_ff(), d, rng),
            ..Self::zeros(config)
        }
    }

    /// `[batch, len, d] → [batch, len, d]`. Dropout is active only when `rng`
    /// is supplied.
    pub fn forward(&self, x: &Array3<f32>, mut rng: Option<&mut StdRng>) -> Result<Array3<f32>> {
        let mut out = Array3::zeros(x.dim());
        for (b, xb) in x.outer_iter().enumerate() {
            let mut attn = self.self_attention(&xb, rng.as_deref_mut());
            self.dropout.apply(&mut attn, rng.as_deref_mut());
            let h = self.norm1.forward(&(&xb + &attn));

            let mut ff = self.feed_forward(&h, rng.as_deref_mut());
            self.dropout.apply(&mut ff, rng.as_deref_mut());
            let h = self.norm2.forward(&(&h + &ff));

            out.index_axis_mut(Axis(0), b).assign(&h);
        }
        Ok(out)
    }

    /// Scaled dot-product attention for one sequence `[len, d]`.
    fn self_attention(&self, x: &ArrayView2<f32>, mut rng: Option<&mut StdRng>) -> Array2<f32> {
        let (len, d) = x.dim();
        let head_dim = d / self.n_heads;
        let scale = 1.0 / (head_dim as f32).sqrt();

        let q = self.w_q.forward(x);
        let k = self.w_k.forward(x);
        let v = self.w_v.forward(x);

        let mut concat = Array2::zeros((len, d));
        for head in 0..self.n_heads {
            let (lo, hi) = (head * head_dim, (head + 1) * head_dim);
            let q_h = q.slice(s![.., lo..hi]);
            let k_h = k.slice(s![.., lo..hi]);
            let v_h = v.slice(s![.., lo..hi]);

            let mut scores = q_h.dot(&k_h.t()) * scale;
            if self.causal {
                for i in 0..len {
                    scores.slice_mut(s![i, i + 1..]).fill(f32::NEG_INFINITY);
                }
            }
            for row in scores.rows_mut() {
                softmax_in_place(row);
            }
            self.dropout.apply(&mut scores, rng.as_deref_mut());

            concat.slice_mut(s![.., lo..hi]).assign(&scores.dot(&v_h));
        }

        self.w_o.forward(&concat)
    }

    fn feed_forward(&self, h: &Array2<f32>, rng: Option<&mut StdRng>) -> Array2<f32> {
        let mut inner = self.ff_up.forward(h).mapv(relu);
        self.dropout.apply(&mut inner, rng);
        self.ff_down.forward(&inner)
    }

    pub fn param_count(&self) -> usize {
        self.w_q.param_count()
            + self.w_k.param_count()
            + self.w_v.param_count()
            + self.w_o.param_count()
            + self.norm1.param_count()
            + self.ff_up.param_count()
            + self.ff_down.param_count()
            + self.norm2.param_count()
    }
}
