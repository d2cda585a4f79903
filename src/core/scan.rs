//! Linear recurrence scan `h_t = a_t ⊙ h_{t-1} + b_t`, with `h_{-1} = 0`.
//!
//! Every step is an affine map of the previous state, so steps compose:
//!
//! ```text
//! (a1, b1) ⊕ (a2, b2) = (a1 ⊙ a2, a2 ⊙ b1 + b2)
//! ```
//!
//! Applying `(a1, b1)` then `(a2, b2)` to any `h` gives
//! `a2 ⊙ (a1 ⊙ h + b1) + b2`, which is `(a1, b1) ⊕ (a2, b2)` applied to `h`.
//! `⊕` is associative with identity `(1, 0)`, so any bracketing of the
//! step sequence yields the same prefix states. The chunked scan relies on
//! exactly this: it brackets the sequence into chunks, scans each chunk from
//! the identity, then folds each chunk's aggregate into a carry.
//!
//! All arrays are `[len, d_model, d_state]`; the operator acts elementwise.

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::config::ScanMode;

use super::ssm_state::RecurrentState;

/// One affine step `h ↦ a ⊙ h + b`, or a composition of several.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanElement {
    pub a: Array2<f32>,
    pub b: Array2<f32>,
}

impl ScanElement {
    /// `(1, 0)`: leaves every state unchanged.
    pub fn identity(d_model: usize, d_state: usize) -> Self {
        Self {
            a: Array2::ones((d_model, d_state)),
            b: Array2::zeros((d_model, d_state)),
        }
    }

    pub fn from_views(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Self {
        Self {
            a: a.to_owned(),
            b: b.to_owned(),
        }
    }

    /// `self ⊕ next`: apply `self` first, then `next`.
    pub fn combine(&self, next: &ScanElement) -> ScanElement {
        ScanElement {
            a: &self.a * &next.a,
            b: &next.a * &self.b + &next.b,
        }
    }

    /// Apply to a state.
    pub fn apply(&self, h: &Array2<f32>) -> Array2<f32> {
        &self.a * h + &self.b
    }
}

/// Run the recurrence with the configured strategy. Returns every
/// post-update state `h_0 .. h_{len-1}`.
pub fn linear_recurrence(mode: ScanMode, a: &Array3<f32>, b: &Array3<f32>) -> Array3<f32> {
    debug_assert_eq!(a.dim(), b.dim());
    match mode {
        ScanMode::Sequential => scan_sequential(a, b),
        ScanMode::Chunked { chunk_len } => scan_chunked(a, b, chunk_len),
    }
}

/// Time-ordered loop over a single zero-initialised state.
pub fn scan_sequential(a: &Array3<f32>, b: &Array3<f32>) -> Array3<f32> {
    let (len, d_model, d_state) = a.dim();
    let mut state = RecurrentState::new(d_model, d_state);
    let mut states = Array3::zeros((len, d_model, d_state));
    for t in 0..len {
        state.step(a.index_axis(Axis(0), t), b.index_axis(Axis(0), t));
        states.index_axis_mut(Axis(0), t).assign(&state.h);
    }
    states
}

/// Three-phase chunked scan.
///
/// 1. Each chunk is scanned from the identity in parallel, recording the
///    running composition `(A_t, B_t)` for every position.
/// 2. Chunk aggregates are folded left to right into the carry entering
///    each chunk. This is the only sequential part: one step per chunk.
/// 3. Every position applies its running composition to its chunk's carry,
///    `h_t = A_t ⊙ carry + B_t`, in parallel.
///
/// Chunk boundaries depend only on `chunk_len`, so results do not vary with
/// the thread count. They match [`scan_sequential`] up to float rounding.
pub fn scan_chunked(a: &Array3<f32>, b: &Array3<f32>, chunk_len: usize) -> Array3<f32> {
    let (len, d_model, d_state) = a.dim();
    let chunk_len = chunk_len.max(1);
    let starts: Vec<usize> = (0..len).step_by(chunk_len).collect();

    // Phase 1
    let locals: Vec<(Array3<f32>, Array3<f32>)> = starts
        .par_iter()
        .map(|&start| {
            let end = (start + chunk_len).min(len);
            let mut acc = ScanElement::identity(d_model, d_state);
            let mut cum_a = Array3::zeros((end - start, d_model, d_state));
            let mut cum_b = Array3::zeros((end - start, d_model, d_state));
            for t in start..end {
                let a_t = a.index_axis(Axis(0), t);
                acc.a *= &a_t;
                acc.b *= &a_t;
                acc.b += &b.index_axis(Axis(0), t);
                cum_a.index_axis_mut(Axis(0), t - start).assign(&acc.a);
                cum_b.index_axis_mut(Axis(0), t - start).assign(&acc.b);
            }
            (cum_a, cum_b)
        })
        .collect();

    // Phase 2
    let mut carries = Vec::with_capacity(locals.len());
    let mut carry = Array2::zeros((d_model, d_state));
    for (cum_a, cum_b) in &locals {
        carries.push(carry.clone());
        let last = cum_a.len_of(Axis(0)) - 1;
        let aggregate = ScanElement::from_views(
            cum_a.index_axis(Axis(0), last),
            cum_b.index_axis(Axis(0), last),
        );
        carry = aggregate.apply(&carry);
    }

    // Phase 3
    let chunks: Vec<Array3<f32>> = locals
        .into_par_iter()
        .zip(carries.into_par_iter())
        .map(|((cum_a, mut cum_b), carry)| {
            for (mut h, a_t) in cum_b.outer_iter_mut().zip(cum_a.outer_iter()) {
                h += &(&a_t * &carry);
            }
            cum_b
        })
        .collect();

    let mut states = Array3::zeros((len, d_model, d_state));
    for (&start, chunk) in starts.iter().zip(&chunks) {
        let end = start + chunk.len_of(Axis(0));
        states.slice_mut(s![start..end, .., ..]).assign(chunk);
    }
    states
}
