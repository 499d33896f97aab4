//! Importance-weight utilities: log-sum-exp, effective sample size and multinomial
//! resampling.
//!
//! The resampling decision is a single scalar per batch, never per particle, so the
//! same functions serve a plain sequential run and a batched one.

use burn::prelude::Backend;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use num_traits::Float;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;

use crate::error::SmcError;
use crate::point::Point;

/// A batch of particles that can be reordered by index.
pub trait Particles: Sized {
    /// Number of particles in the batch.
    fn n_particles(&self) -> usize;

    /// Returns the particles at `indices`, in order, with repetition allowed.
    fn gather(&self, indices: &[usize]) -> Self;
}

impl<B: Backend> Particles for Point<B> {
    fn n_particles(&self) -> usize {
        self.batch_size()
    }

    fn gather(&self, indices: &[usize]) -> Self {
        Point::gather(self, indices)
    }
}

impl<T: Clone> Particles for Array1<T> {
    fn n_particles(&self) -> usize {
        self.len()
    }

    fn gather(&self, indices: &[usize]) -> Self {
        self.select(Axis(0), indices)
    }
}

impl<T: Clone> Particles for Array2<T> {
    fn n_particles(&self) -> usize {
        self.nrows()
    }

    fn gather(&self, indices: &[usize]) -> Self {
        self.select(Axis(0), indices)
    }
}

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns `-inf` for an empty input or one made only of `-inf`, and `NaN` if any
/// value is `NaN`.
pub fn log_sum_exp<T: Float>(values: ArrayView1<T>) -> T {
    if values.iter().any(|v| v.is_nan()) {
        return T::nan();
    }
    let max = values.fold(T::neg_infinity(), |m, &v| m.max(v));
    if !max.is_finite() {
        return max;
    }
    let sum = values.fold(T::zero(), |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// Log of the effective sample size of unnormalized log weights,
/// `2 * logsumexp(w) - logsumexp(2 * w)`.
///
/// Equal weights give `ln(N)`; all mass on one particle gives `0`.
pub fn log_effective_sample_size<T: Float>(log_weights: ArrayView1<T>) -> T {
    let two = T::one() + T::one();
    let doubled = log_weights.mapv(|w| two * w);
    two * log_sum_exp(log_weights) - log_sum_exp(doubled.view())
}

/// Log of the normalizing-constant estimate `mean(exp(log_weights))`.
pub fn log_z_estimate(log_weights: ArrayView1<f64>) -> f64 {
    log_sum_exp(log_weights) - (log_weights.len() as f64).ln()
}

/// Self-normalized importance-weighted mean of the rows of `x`.
pub fn importance_weighted_mean(
    x: ArrayView2<f64>,
    log_weights: ArrayView1<f64>,
) -> Result<Array1<f64>, SmcError> {
    assert_eq!(
        x.nrows(),
        log_weights.len(),
        "one log weight per row is required"
    );
    let normalizer = log_sum_exp(log_weights);
    if !normalizer.is_finite() {
        return Err(SmcError::DegenerateWeights);
    }
    let weights = log_weights.mapv(|w| (w - normalizer).exp());
    Ok(weights.dot(&x))
}

/// Draws `N` indices with replacement from the categorical distribution proportional to
/// `exp(log_weights - max(log_weights))` and gathers the corresponding particles.
///
/// # Errors
///
/// [`SmcError::DegenerateWeights`] when no weight is positive and finite.
pub fn simple_resampling<S: Particles>(
    rng: &mut SmallRng,
    log_weights: ArrayView1<f64>,
    particles: &S,
) -> Result<(Vec<usize>, S), SmcError> {
    let n = log_weights.len();
    assert_eq!(
        n,
        particles.n_particles(),
        "one log weight per particle is required"
    );
    let max = *log_weights.max_skipnan();
    if !max.is_finite() {
        return Err(SmcError::DegenerateWeights);
    }
    let categorical = WeightedIndex::new(log_weights.iter().map(|&w| (w - max).exp()))
        .map_err(|_| SmcError::DegenerateWeights)?;
    let indices: Vec<usize> = (0..n).map(|_| categorical.sample(rng)).collect();
    let resampled = particles.gather(&indices);
    Ok((indices, resampled))
}

/// Whether a batch of `n` particles with log ESS `log_ess` falls below the normalized
/// ESS threshold.
pub fn should_resample(log_ess: f64, n: usize, resample_threshold: f64) -> bool {
    log_ess - (n as f64).ln() < resample_threshold.ln()
}

/// Resamples when the normalized ESS `exp(log_ess) / N` falls below `resample_threshold`.
///
/// After resampling every log weight equals `logsumexp(log_weights) - ln(N)`: uniform
/// weights that carry the same total mass. Otherwise samples and weights are returned
/// unchanged. The third element is the log ESS measured before the decision.
pub fn optionally_resample<S: Particles>(
    rng: &mut SmallRng,
    log_weights: Array1<f64>,
    samples: S,
    resample_threshold: f64,
) -> Result<(S, Array1<f64>, f64), SmcError> {
    let n = log_weights.len() as f64;
    let log_ess = log_effective_sample_size(log_weights.view());

    if should_resample(log_ess, log_weights.len(), resample_threshold) {
        tracing::trace!(
            ess = log_ess.exp(),
            threshold = resample_threshold,
            "Resampling"
        );
        let (_, resampled) = simple_resampling(rng, log_weights.view(), &samples)?;
        let uniform = log_sum_exp(log_weights.view()) - n.ln();
        Ok((resampled, Array1::from_elem(log_weights.len(), uniform), log_ess))
    } else {
        Ok((samples, log_weights, log_ess))
    }
}
