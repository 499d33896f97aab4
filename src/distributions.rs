/*!
Log-density contract consumed by the sampler, plus a diagonal Gaussian that
implements it.

The sampler never builds flows or targets itself. It only needs two batched,
differentiable log densities: `log_q` (the flow) and `log_p` (the unnormalized
target). Both are expressed through [`LogProbFn`].

# Examples

```rust
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use fab_smc::distributions::{DiagGaussian, LogProbFn};
use rand::{rngs::SmallRng, SeedableRng};

type BackendType = Autodiff<NdArray<f64>>;

let q = DiagGaussian::standard(2);
let mut rng = SmallRng::seed_from_u64(0);
let x: Tensor<BackendType, 2> = q.sample(&mut rng, 16, &Default::default());
let log_q = q.log_prob_batch(&x);
assert_eq!(log_q.dims(), [16]);
```
*/

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::core::rows_to_tensor;

/// A batched log density over positions of shape `[batch_size, dim]`.
///
/// Implementations must treat rows independently: the value for row `i` may only
/// depend on row `i`. The sampler relies on this to obtain per-particle gradients
/// from a single backward pass over the whole batch.
///
/// # Type Parameters
///
/// * `B`: The autodiff backend from the `burn` crate.
pub trait LogProbFn<B: AutodiffBackend> {
    /// Compute the log density for a batch of positions.
    ///
    /// # Parameters
    ///
    /// * `positions`: A tensor of shape `[batch_size, D]`.
    ///
    /// # Returns
    ///
    /// A 1D tensor of shape `[batch_size]`.
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1>;
}

/**
A Gaussian with diagonal covariance, parameterized by its mean and per-coordinate
standard deviation.

It serves as the base distribution `q` and as a target `p` in tests, benchmarks and
the demo binary.

# Examples

```rust
use fab_smc::distributions::DiagGaussian;

let p = DiagGaussian::new(vec![1.0, 1.0], vec![1.0, 1.0]);
assert_eq!(p.dim(), 2);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct DiagGaussian {
    pub loc: Vec<f64>,
    pub scale: Vec<f64>,
}

impl DiagGaussian {
    /// Creates a diagonal Gaussian. Panics if `loc` and `scale` differ in length or
    /// any scale is not strictly positive.
    pub fn new(loc: Vec<f64>, scale: Vec<f64>) -> Self {
        assert_eq!(
            loc.len(),
            scale.len(),
            "loc and scale must have the same dimension"
        );
        assert!(
            scale.iter().all(|&s| s > 0.0),
            "scale must be strictly positive"
        );
        Self { loc, scale }
    }

    /// The standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self::new(vec![0.0; dim], vec![1.0; dim])
    }

    pub fn dim(&self) -> usize {
        self.loc.len()
    }

    /// Draws `n` samples as a `[n, dim]` tensor using the caller's generator.
    pub fn sample<B: Backend>(
        &self,
        rng: &mut SmallRng,
        n: usize,
        device: &B::Device,
    ) -> Tensor<B, 2> {
        let dim = self.dim();
        let mut data = Vec::with_capacity(n * dim);
        for _ in 0..n {
            for (&mu, &sigma) in self.loc.iter().zip(self.scale.iter()) {
                let z: f64 = rng.sample(StandardNormal);
                data.push(mu + sigma * z);
            }
        }
        rows_to_tensor(data, n, dim, device)
    }

    /// Normalized log density of a single host-side point.
    pub fn log_prob(&self, x: &[f64]) -> f64 {
        let mut lp = self.log_normalizer();
        for ((&xi, &mu), &sigma) in x.iter().zip(self.loc.iter()).zip(self.scale.iter()) {
            let z = (xi - mu) / sigma;
            lp -= 0.5 * z * z;
        }
        lp
    }

    fn log_normalizer(&self) -> f64 {
        let log_det: f64 = self.scale.iter().map(|s| s.ln()).sum();
        -0.5 * self.dim() as f64 * (2.0 * PI).ln() - log_det
    }
}

impl<B: AutodiffBackend> LogProbFn<B> for DiagGaussian {
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, dim] = positions.dims();
        assert_eq!(dim, self.dim(), "position dimension does not match the Gaussian");
        let device = positions.device();

        // Broadcast loc and scale on the host so no shape-1 broadcasting is needed.
        let loc = rows_to_tensor::<B>(self.loc.repeat(n), n, dim, &device);
        let scale = rows_to_tensor::<B>(self.scale.repeat(n), n, dim, &device);

        let z = positions.clone().sub(loc).div(scale);
        z.powi_scalar(2)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .add_scalar(self.log_normalizer())
    }
}

/// `inner` restricted to `x[0] <= bound`, with log density `-inf` beyond the bound.
#[cfg(test)]
pub(crate) struct Truncated {
    pub inner: DiagGaussian,
    pub bound: f64,
}

#[cfg(test)]
impl<B: AutodiffBackend> LogProbFn<B> for Truncated {
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = positions.dims();
        let outside = positions
            .clone()
            .slice([0..n, 0..1])
            .greater_elem(self.bound)
            .squeeze::<1>(1);
        self.inner
            .log_prob_batch(positions)
            .mask_fill(outside, f64::NEG_INFINITY)
    }
}
