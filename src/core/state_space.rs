//! State-space ("memory") block: a selective linear recurrence with cost
//! linear in sequence length.
//!
//! For every sequence and every channel `c` the block runs a small linear
//! dynamical system with `d_state` hidden values:
//!
//! ```text
//! [v, r] = in_proj(x)                          v, r ∈ R^{len × d}
//! Δ_t    = clamp(softplus(dt_proj(v_t)), Δ_min, Δ_max)
//! B_t    = b_proj(v_t),  C_t = c_proj(v_t)     ∈ R^{d_state}
//! Ā_t    = exp(clamp(A ⊙ Δ_t, -e_max, 0))      zero-order hold, A ∈ R^{d × d_state}
//! h_t    = Ā_t ⊙ h_{t-1} + Δ_t B_t v_t         h_{-1} = 0
//! y_t    = h_t · C_t + D ⊙ v_t
//! out    = out_proj(y ⊙ silu(r))
//! ```
//!
//! The block returns `out` only; the caller adds the residual. In sequential
//! mode one [`RecurrentState`] is stepped through time and each `y_t` is read
//! out immediately. In chunked mode the prefix scan in [`super::scan`]
//! produces every state first.

use ndarray::{s, Array1, Array2, Array3, ArrayBase, Axis, Data, Ix2, Zip};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ScanMode};
use crate::error::Result;

use super::ops::{silu, softplus, Linear};
use super::scan::linear_recurrence;
use super::ssm_state::RecurrentState;

/// Upper bound on the per-step step size Δ.
pub const MAX_STEP_SIZE: f32 = 100.0;

/// Lower bound on Δ. Keeps the step strictly positive where `softplus`
/// underflows to zero.
pub const MIN_STEP_SIZE: f32 = 1e-4;

/// Lower bound on the discretization exponent `A·Δ`. The exponent is also
/// capped at zero, so every per-step transition lies in `[e^-60, 1]`.
pub const MAX_DECAY_EXPONENT: f32 = 60.0;

/// Weights of one state-space block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSpaceBlock {
    /// `d → 2d`, split into value stream `v` and gate stream `r`.
    pub in_proj: Linear,

    /// `d → d`, step size before softplus.
    pub dt_proj: Linear,

    /// `d → d_state`, per-step input matrix `B_t`.
    pub b_proj: Linear,

    /// `d → d_state`, per-step readout `C_t`.
    pub c_proj: Linear,

    /// Continuous-time transition `A ∈ R^{d × d_state}`.
    pub transition: Array2<f32>,

    /// Skip term `D ∈ R^d`.
    pub skip: Array1<f32>,

    /// `d → d`
    pub out_proj: Linear,

    pub scan: ScanMode,
}

impl StateSpaceBlock {
    pub fn zeros(config: &Config) -> Self {
        let d = config.d_model;
        let n = config.d_state;
        Self {
            in_proj: Linear::zeros(d, 2 * d),
            dt_proj: Linear::zeros(d, d),
            b_proj: Linear::zeros(d, n),
            c_proj: Linear::zeros(d, n),
            transition: Array2::zeros((d, n)),
            skip: Array1::zeros(d),
            out_proj: Linear::zeros(d, d),
            scan: config.scan,
        }
    }

    /// Random projections; `A[c, j] = -(j + 1)` and `D = 1`.
    pub fn init(config: &Config, rng: &mut StdRng) -> Self {
        let d = config.d_model;
        let n = config.d_state;
        Self {
            in_proj: Linear::init(d, 2 * d, rng),
            dt_proj: Linear::init(d, d, rng),
            b_proj: Linear::init(d, n, rng),
            c_proj: Linear::init(d, n, rng),
            transition: Array2::from_shape_fn((d, n), |(_, j)| -((j + 1) as f32)),
            skip: Array1::ones(d),
            out_proj: Linear::init(d, d, rng),
            scan: config.scan,
        }
    }

    pub fn d_model(&self) -> usize {
        self.transition.nrows()
    }

    pub fn d_state(&self) -> usize {
        self.transition.ncols()
    }

    /// `[batch, len, d] → [batch, len, d]`. Sequences are independent and
    /// are processed in parallel; time steps within a sequence are not.
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let d = self.d_model();
        let (batch, len, _) = x.dim();

        let gated: Vec<Array2<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let proj = self.in_proj.forward(&x.index_axis(Axis(0), b));
                let v = proj.slice(s![.., ..d]);
                let r = proj.slice(s![.., d..]);
                let mut y = self.scan_values(&v);
                Zip::from(&mut y).and(&r).for_each(|y, &r| *y *= silu(r));
                y
            })
            .collect();

        let mut y = Array3::zeros((batch, len, d));
        for (b, seq) in gated.iter().enumerate() {
            y.index_axis_mut(Axis(0), b).assign(seq);
        }
        self.out_proj.forward_3d(&y)
    }

    /// Hidden states `[len, d, d_state]` produced while processing one
    /// sequence `x_seq: [len, d]`.
    pub fn hidden_states(&self, x_seq: &Array2<f32>) -> Array3<f32> {
        let d = self.d_model();
        let proj = self.in_proj.forward(x_seq);
        let v = proj.slice(s![.., ..d]);
        let params = self.selective_params(&v);
        let (a_bar, input) = self.discretized_steps(&v, &params);
        linear_recurrence(self.scan, &a_bar, &input)
    }

    /// Discretize, scan and read out one value stream `v: [len, d]`.
    ///
    /// The sequential mode keeps a single `[d, d_state]` state and reads out
    /// each step as it goes. The chunked mode materializes every step.
    fn scan_values<S: Data<Elem = f32>>(&self, v: &ArrayBase<S, Ix2>) -> Array2<f32> {
        let (len, d) = v.dim();
        let params = self.selective_params(v);
        let mut y = Array2::zeros((len, d));

        match self.scan {
            ScanMode::Sequential => {
                let mut state = RecurrentState::new(d, self.d_state());
                for t in 0..len {
                    let (a_bar, input) = self.discretized_step(v, &params, t);
                    state.step(a_bar.view(), input.view());
                    y.row_mut(t).assign(&self.readout(&state.h, v, &params, t));
                }
            }
            ScanMode::Chunked { .. } => {
                let (a_bar, input) = self.discretized_steps(v, &params);
                let states = linear_recurrence(self.scan, &a_bar, &input);
                for (t, h) in states.outer_iter().enumerate() {
                    y.row_mut(t).assign(&self.readout(&h, v, &params, t));
                }
            }
        }
        y
    }

    /// Per-step `Δ_t: [len, d]`, `B_t` and `C_t: [len, d_state]`.
    fn selective_params<S: Data<Elem = f32>>(&self, v: &ArrayBase<S, Ix2>) -> SelectiveParams {
        SelectiveParams {
            step: self.dt_proj.forward(v).mapv(step_size),
            b: self.b_proj.forward(v),
            c: self.c_proj.forward(v),
        }
    }

    /// `(Ā_t, Δ_t B_t v_t)` for one time step, each `[d, d_state]`.
    fn discretized_step<S: Data<Elem = f32>>(
        &self,
        v: &ArrayBase<S, Ix2>,
        params: &SelectiveParams,
        t: usize,
    ) -> (Array2<f32>, Array2<f32>) {
        let shape = self.transition.dim();
        let a_bar = Array2::from_shape_fn(shape, |(c, j)| {
            discretize(self.transition[[c, j]], params.step[[t, c]])
        });
        let input = Array2::from_shape_fn(shape, |(c, j)| {
            params.step[[t, c]] * params.b[[t, j]] * v[[t, c]]
        });
        (a_bar, input)
    }

    /// Every step stacked: `[len, d, d_state]` each.
    fn discretized_steps<S: Data<Elem = f32>>(
        &self,
        v: &ArrayBase<S, Ix2>,
        params: &SelectiveParams,
    ) -> (Array3<f32>, Array3<f32>) {
        let (len, d) = v.dim();
        let n = self.d_state();
        let mut a_bar = Array3::zeros((len, d, n));
        let mut input = Array3::zeros((len, d, n));
        for t in 0..len {
            let (a_t, u_t) = self.discretized_step(v, params, t);
            a_bar.index_axis_mut(Axis(0), t).assign(&a_t);
            input.index_axis_mut(Axis(0), t).assign(&u_t);
        }
        (a_bar, input)
    }

    /// `y_t = h_t · C_t + D ⊙ v_t`
    fn readout<S, T>(
        &self,
        h: &ArrayBase<S, Ix2>,
        v: &ArrayBase<T, Ix2>,
        params: &SelectiveParams,
        t: usize,
    ) -> Array1<f32>
    where
        S: Data<Elem = f32>,
        T: Data<Elem = f32>,
    {
        let mut y = h.dot(&params.c.row(t));
        Zip::from(&mut y)
            .and(&self.skip)
            .and(&v.row(t))
            .for_each(|y, &skip, &x| *y += skip * x);
        y
    }

    pub fn param_count(&self) -> usize {
        self.in_proj.param_count()
            + self.dt_proj.param_count()
            + self.b_proj.param_count()
            + self.c_proj.param_count()
            + self.transition.len()
            + self.skip.len()
            + self.out_proj.param_count()
    }
}

/// Input-dependent parameters of one sequence.
struct SelectiveParams {
    step: Array2<f32>,
    b: Array2<f32>,
    c: Array2<f32>,
}

/// `Δ = softplus(raw)`, confined to `[MIN_STEP_SIZE, MAX_STEP_SIZE]`.
pub fn step_size(raw: f32) -> f32 {
    softplus(raw).clamp(MIN_STEP_SIZE, MAX_STEP_SIZE)
}

/// Zero-order-hold transition `exp(a · Δ)`, with the exponent confined to
/// `[-MAX_DECAY_EXPONENT, 0]`.
pub fn discretize(a: f32, step: f32) -> f32 {
    let exponent = a * step;
    if exponent.is_nan() {
        return 1.0;
    }
    exponent.clamp(-MAX_DECAY_EXPONENT, 0.0).exp()
}
