//! Shared numeric building blocks: linear maps, LayerNorm, dropout,
//! activations, softmax and cross entropy.
//!
//! Activations are written against token-major matrices `[tokens, width]`.
//! Sequence tensors `[batch, len, width]` are flattened to that layout and
//! restored afterwards, so every layer sees the same row convention.

use ndarray::{Array, Array1, Array2, Array3, ArrayBase, ArrayViewMut1, CowArray, Data, Dimension, Ix2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Inputs above this are returned unchanged by [`softplus`].
const SOFTPLUS_LINEAR_THRESHOLD: f32 = 20.0;

/// Affine map `y = x · Wᵀ + b`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    /// Weight: `[out_features, in_features]`
    pub weight: Array2<f32>,

    /// Bias: `[out_features]`
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// Uniform `±1/sqrt(in_features)` initialisation for weight and bias.
    pub fn init(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = Array2::from_shape_simple_fn((out_features, in_features), || dist.sample(rng));
        let bias = Array1::from_shape_simple_fn(out_features, || dist.sample(rng));
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Apply to token-major rows `[tokens, in] → [tokens, out]`.
    pub fn forward<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix2>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Apply to a sequence tensor `[batch, len, in] → [batch, len, out]`.
    pub fn forward_3d(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, len, _) = x.dim();
        let y = self.forward(&flatten_tokens(x)?);
        unflatten_tokens(y, batch, len)
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// LayerNorm over the last axis with learnable gain and bias.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerNorm {
    pub gain: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(width: usize, eps: f32) -> Self {
        Self {
            gain: Array1::ones(width),
            bias: Array1::zeros(width),
            eps,
        }
    }

    pub fn forward<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix2>) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            let mean = row.mean().unwrap_or(0.0);
            let var = row.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            let inv_std = 1.0 / (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) * inv_std);
            row *= &self.gain;
            row += &self.bias;
        }
        out
    }

    pub fn forward_3d(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, len, _) = x.dim();
        let y = self.forward(&flatten_tokens(x)?);
        unflatten_tokens(y, batch, len)
    }

    pub fn param_count(&self) -> usize {
        self.gain.len() + self.bias.len()
    }
}

/// Inverted dropout. Inactive unless a random source is supplied.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Dropout {
    pub p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    /// Zero each element with probability `p` and rescale survivors by
    /// `1 / (1 - p)`. With `rng == None` (evaluation) this is the identity.
    pub fn apply<D: Dimension>(&self, x: &mut Array<f32, D>, rng: Option<&mut StdRng>) {
        let Some(rng) = rng else { return };
        if self.p <= 0.0 {
            return;
        }
        let keep = 1.0 - self.p;
        let p = self.p;
        x.mapv_inplace(|v| if rng.gen::<f32>() < p { 0.0 } else { v / keep });
    }
}

/// View `[batch, len, width]` as `[batch * len, width]`.
pub fn flatten_tokens(x: &Array3<f32>) -> Result<CowArray<'_, f32, Ix2>> {
    let (batch, len, width) = x.dim();
    Ok(x.to_shape((batch * len, width))?)
}

/// Inverse of [`flatten_tokens`].
pub fn unflatten_tokens(x: Array2<f32>, batch: usize, len: usize) -> Result<Array3<f32>> {
    let width = x.ncols();
    let x = x.as_standard_layout().into_owned();
    Ok(x.into_shape_with_order((batch, len, width))?)
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// SiLU / Swish: `x · sigmoid(x)`.
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

/// GELU, tanh approximation.
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// `log(1 + eˣ)` without overflow for large `x`.
pub fn softplus(x: f32) -> f32 {
    if x > SOFTPLUS_LINEAR_THRESHOLD {
        x
    } else if x < -SOFTPLUS_LINEAR_THRESHOLD {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}

/// In-place softmax. Entries of `-inf` receive zero weight; a row with no
/// finite entry becomes uniform.
pub fn softmax_in_place(mut row: ArrayViewMut1<f32>) {
    if row.is_empty() {
        return;
    }
    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        let uniform = 1.0 / row.len() as f32;
        row.fill(uniform);
        return;
    }
    row.mapv_inplace(|v| (v - max_val).exp());
    let sum = row.sum();
    if sum > 0.0 {
        row.mapv_inplace(|v| v / sum);
    }
}

/// Mean cross entropy of `logits: [tokens, classes]` against class ids.
///
/// Callers guarantee `targets.len() == logits.nrows()` and every id is a
/// valid column.
pub fn cross_entropy<S: Data<Elem = f32>>(logits: &ArrayBase<S, Ix2>, targets: &[u32]) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    let mut total = 0.0f64;
    for (row, &target) in logits.rows().into_iter().zip(targets) {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        total += (log_sum - row[target as usize]) as f64;
    }
    (total / targets.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array3};
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward() {
        let mut lin = Linear::zeros(2, 3);
        lin.weight = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        lin.bias = arr1(&[0.5, 0.0, -1.0]);
        let y = lin.forward(&arr2(&[[2.0, 3.0]]));
        assert_eq!(y, arr2(&[[2.5, 3.0, 4.0]]));
        assert_eq!(lin.param_count(), 9);
    }

    #[test]
    fn test_linear_3d_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let lin = Linear::init(4, 6, &mut rng);
        let x = Array3::ones((2, 5, 4));
        let y = lin.forward_3d(&x).unwrap();
        assert_eq!(y.dim(), (2, 5, 6));
    }

    #[test]
    fn test_linear_init_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let lin = Linear::init(16, 8, &mut rng);
        let bound = 0.25 + 1e-6;
        assert!(lin.weight.iter().all(|w| w.abs() <= bound));
        assert!(lin.bias.iter().all(|b| b.abs() <= bound));
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let ln = LayerNorm::new(4, 1e-5);
        let y = ln.forward(&arr2(&[[1.0, 2.0, 3.0, 4.0]]));
        let mean = y.row(0).mean().unwrap();
        let var = y.row(0).mapv(|v| v * v).mean().unwrap();
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_dropout_eval_is_identity() {
        let d = Dropout::new(0.5);
        let mut x = Array2::<f32>::ones((4, 4));
        d.apply(&mut x, None);
        assert!(x.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_dropout_train_scales_survivors() {
        let d = Dropout::new(0.5);
        let mut rng = StdRng::seed_from_u64(3);
        let mut x = Array2::<f32>::ones((32, 32));
        d.apply(&mut x, Some(&mut rng));
        assert!(x.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        let zeros = x.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 300 && zeros < 724, "zeros = {}", zeros);
    }

    #[test]
    fn test_activations() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(-100.0) >= 0.0 && sigmoid(100.0) <= 1.0);
        assert!((silu(0.0)).abs() < 1e-6);
        assert!(silu(-1.0) < 0.0);
        assert!((gelu(0.0)).abs() < 1e-6);
        assert!((gelu(3.0) - 3.0).abs() < 0.01);
        assert_eq!(relu(-2.0), 0.0);
    }

    #[test]
    fn test_softplus_stable() {
        assert!((softplus(0.0) - 2.0f32.ln()).abs() < 1e-6);
        assert_eq!(softplus(1e30), 1e30);
        assert!(softplus(-1e30) >= 0.0);
        assert!(softplus(-5.0) > 0.0);
    }

    #[test]
    fn test_softmax_masked() {
        let mut x = arr1(&[1.0, f32::NEG_INFINITY, 1.0]);
        softmax_in_place(x.view_mut());
        assert!((x[0] - 0.5).abs() < 1e-6);
        assert_eq!(x[1], 0.0);
        assert!((x.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let logits = Array2::<f32>::zeros((3, 256));
        let loss = cross_entropy(&logits, &[0, 17, 255]);
        assert!((loss - (256.0f32).ln()).abs() < 1e-4);
    }
}
