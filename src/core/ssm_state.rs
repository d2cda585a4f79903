//! Recurrent state for the state-space scan.
//!
//! Each channel of a sequence owns `d_state` hidden values, stored together
//! as `h ∈ R^{d_model × d_state}`. The state starts at zero for every block
//! evaluation and is dropped once the block has emitted its output: nothing
//! is carried across blocks, sequences or batches.

use ndarray::{Array2, ArrayView2};

/// Hidden state of one sequence inside one state-space block.
#[derive(Clone, Debug)]
pub struct RecurrentState {
    /// `h ∈ R^{d_model × d_state}`
    pub h: Array2<f32>,

    /// Number of time steps folded into `h`.
    pub steps: u64,
}

impl RecurrentState {
    /// Zero state.
    pub fn new(d_model: usize, d_state: usize) -> Self {
        Self {
            h: Array2::zeros((d_model, d_state)),
            steps: 0,
        }
    }

    /// Advance one time step: `h' = Ā ⊙ h + B̄x`.
    pub fn step(&mut self, transition: ArrayView2<f32>, input: ArrayView2<f32>) {
        self.h *= &transition;
        self.h += &input;
        self.steps += 1;
    }

    pub fn reset(&mut self) {
        self.h.fill(0.0);
        self.steps = 0;
    }

    /// Whether every entry is finite.
    pub fn is_healthy(&self) -> bool {
        self.h.iter().all(|v| v.is_finite())
    }

    /// Frobenius norm of the state.
    pub fn norm(&self) -> f32 {
        self.h.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn size_bytes(&self) -> usize {
        self.h.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_init() {
        let state = RecurrentState::new(4, 16);
        assert_eq!(state.h.dim(), (4, 16));
        assert_eq!(state.steps, 0);
        assert!(state.is_healthy());
        assert_eq!(state.norm(), 0.0);
    }

    #[test]
    fn test_step_decays_and_accumulates() {
        let mut state = RecurrentState::new(2, 3);
        let a = Array2::from_elem((2, 3), 0.9);
        let b = Array2::from_elem((2, 3), 1.0);

        state.step(a.view(), b.view());
        assert_eq!(state.steps, 1);
        assert!((state.h[[0, 0]] - 1.0).abs() < 1e-6);

        state.step(a.view(), b.view());
        assert!((state.h[[1, 2]] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_reset() {
        let mut state = RecurrentState::new(2, 2);
        let ones = Array2::ones((2, 2));
        state.step(ones.view(), ones.view());
        state.reset();
        assert_eq!(state.norm(), 0.0);
        assert_eq!(state.steps, 0);
    }

    #[test]
    fn test_unhealthy_detected() {
        let mut state = RecurrentState::new(1, 2);
        state.h[[0, 1]] = f32::NAN;
        assert!(!state.is_healthy());
    }

    #[test]
    fn test_size_bytes() {
        assert_eq!(RecurrentState::new(8, 16).size_bytes(), 8 * 16 * 4);
    }
}
