//! Per-particle state carried through the annealing chain, the annealed log density
//! and the repair of non-finite particles.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;

use crate::core::{finite_rows, index_tensor, row_mask, tensor_to_array1, tensor_to_vec};
use crate::distributions::LogProbFn;
use crate::error::SmcError;

/// A batch of particles.
///
/// Positions and gradients are tensors of shape `[batch_size, dim]`; the log densities
/// are host-side arrays of length `batch_size`. Gradients are stored per density so
/// that the gradient of the annealed density at any `beta` can be formed without
/// re-evaluating the flow or the target.
#[derive(Debug, Clone)]
pub struct Point<B: Backend> {
    /// Positions, `[batch_size, dim]`.
    pub x: Tensor<B, 2>,
    /// Log density of `x` under the base (flow) distribution.
    pub log_q: Array1<f64>,
    /// Unnormalized log density of `x` under the target.
    pub log_p: Array1<f64>,
    /// Gradient of `log_q` with respect to `x`, when the transition operator needs it.
    pub grad_log_q: Option<Tensor<B, 2>>,
    /// Gradient of `log_p` with respect to `x`, when the transition operator needs it.
    pub grad_log_p: Option<Tensor<B, 2>>,
}

/// Log density of the annealed alpha-divergence target at interpolation level `beta`.
///
/// `beta = 0` gives `log_q`; `beta = 1` gives `alpha * log_p - (alpha - 1) * log_q`.
/// With `alpha = 1` this is the usual geometric AIS path from `q` to `p`.
pub fn get_intermediate_log_prob(log_q: f64, log_p: f64, beta: f64, alpha: f64) -> f64 {
    let (coef_q, coef_p) = annealing_coefficients(beta, alpha);
    coef_q * log_q + coef_p * log_p
}

/// Coefficients `(c_q, c_p)` of the annealed density `c_q * log_q + c_p * log_p`.
pub(crate) fn annealing_coefficients(beta: f64, alpha: f64) -> (f64, f64) {
    ((1.0 - beta) + beta * (1.0 - alpha), beta * alpha)
}

/// Per-particle increment of the log importance weight when moving from
/// `betas[step_index]` to `betas[step_index + 1]`.
///
/// Uses the `log_q`/`log_p` stored on the point, never fresh evaluations, so the
/// weights stay consistent with the trajectory that produced them.
pub fn log_weight_contribution_point<B: Backend>(
    point: &Point<B>,
    step_index: usize,
    betas: &[f64],
    alpha: f64,
) -> Array1<f64> {
    let numerator = point.annealed_log_prob(betas[step_index + 1], alpha);
    let denominator = point.annealed_log_prob(betas[step_index], alpha);
    numerator - denominator
}

/// Evaluates both densities at `x` and wraps them into a [`Point`].
///
/// With `with_grad`, each density is evaluated on its own `require_grad` copy of `x`
/// and differentiated with a single backward pass over the batch.
pub fn create_point<B, Q, P>(x: Tensor<B, 2>, log_q_fn: &Q, log_p_fn: &P, with_grad: bool) -> Point<B>
where
    B: AutodiffBackend,
    Q: LogProbFn<B>,
    P: LogProbFn<B>,
{
    let x = x.detach();
    if !with_grad {
        let log_q = tensor_to_array1(log_q_fn.log_prob_batch(&x));
        let log_p = tensor_to_array1(log_p_fn.log_prob_batch(&x));
        return Point {
            x,
            log_q,
            log_p,
            grad_log_q: None,
            grad_log_p: None,
        };
    }

    let (log_q, grad_log_q) = value_and_grad(&x, log_q_fn);
    let (log_p, grad_log_p) = value_and_grad(&x, log_p_fn);
    Point {
        x,
        log_q,
        log_p,
        grad_log_q: Some(grad_log_q),
        grad_log_p: Some(grad_log_p),
    }
}

fn value_and_grad<B: AutodiffBackend, F: LogProbFn<B>>(
    x: &Tensor<B, 2>,
    log_prob_fn: &F,
) -> (Array1<f64>, Tensor<B, 2>) {
    let pos = x.clone().detach().require_grad();
    let logp = log_prob_fn.log_prob_batch(&pos);
    let grads = logp.backward();
    // A density that ignores `x` has no gradient node; its gradient is zero.
    let grad = match pos.grad(&grads) {
        Some(g) => Tensor::<B, 2>::from_inner(g),
        None => Tensor::<B, 2>::zeros(x.dims(), &x.device()),
    };
    (tensor_to_array1(logp.detach()), grad)
}

impl<B: Backend> Point<B> {
    /// Number of particles.
    pub fn batch_size(&self) -> usize {
        self.x.dims()[0]
    }

    /// Dimension of each particle.
    pub fn dim(&self) -> usize {
        self.x.dims()[1]
    }

    /// Whether both per-density gradients are stored.
    pub fn has_grad(&self) -> bool {
        self.grad_log_q.is_some() && self.grad_log_p.is_some()
    }

    /// Annealed log density of every particle at level `beta`.
    pub fn annealed_log_prob(&self, beta: f64, alpha: f64) -> Array1<f64> {
        let (coef_q, coef_p) = annealing_coefficients(beta, alpha);
        &self.log_q * coef_q + &self.log_p * coef_p
    }

    /// Gradient of the annealed log density at level `beta`, if gradients are stored.
    pub fn annealed_grad(&self, beta: f64, alpha: f64) -> Option<Tensor<B, 2>> {
        let (coef_q, coef_p) = annealing_coefficients(beta, alpha);
        match (&self.grad_log_q, &self.grad_log_p) {
            (Some(gq), Some(gp)) => Some(
                gq.clone()
                    .mul_scalar(coef_q)
                    .add(gp.clone().mul_scalar(coef_p)),
            ),
            _ => None,
        }
    }

    /// `true` for every particle whose position and both log densities are finite.
    pub fn valid_mask(&self) -> Vec<bool> {
        let dim = self.dim();
        let x_finite = finite_rows(&tensor_to_vec(self.x.clone()), dim);
        x_finite
            .iter()
            .zip(self.log_q.iter())
            .zip(self.log_p.iter())
            .map(|((&xf, lq), lp)| xf && lq.is_finite() && lp.is_finite())
            .collect()
    }

    /// Gathers particles by index (with repetition), keeping every field aligned.
    pub fn gather(&self, indices: &[usize]) -> Self {
        let device = self.x.device();
        let idx = index_tensor::<B>(indices, &device);
        Point {
            x: self.x.clone().select(0, idx.clone()),
            log_q: indices.iter().map(|&i| self.log_q[i]).collect(),
            log_p: indices.iter().map(|&i| self.log_p[i]).collect(),
            grad_log_q: self
                .grad_log_q
                .as_ref()
                .map(|g| g.clone().select(0, idx.clone())),
            grad_log_p: self.grad_log_p.as_ref().map(|g| g.clone().select(0, idx)),
        }
    }

    /// Particle-wise choice: row `i` comes from `self` where `mask[i]`, from `other`
    /// otherwise. Gradients survive only if both sides carry them.
    pub fn select_where(self, mask: &[bool], other: Point<B>) -> Point<B> {
        assert_eq!(mask.len(), self.batch_size(), "mask length must equal batch size");
        assert_eq!(
            self.x.dims(),
            other.x.dims(),
            "cannot merge points of different shapes"
        );
        let device = self.x.device();
        let mask_big = row_mask::<B>(mask, self.dim(), &device);

        let pick = |a: &Array1<f64>, b: &Array1<f64>| -> Array1<f64> {
            mask.iter()
                .zip(a.iter().zip(b.iter()))
                .map(|(&m, (&a, &b))| if m { a } else { b })
                .collect()
        };
        let log_q = pick(&self.log_q, &other.log_q);
        let log_p = pick(&self.log_p, &other.log_p);

        let merge = |a: Option<Tensor<B, 2>>, b: Option<Tensor<B, 2>>| match (a, b) {
            (Some(a), Some(b)) => Some(b.mask_where(mask_big.clone(), a)),
            _ => None,
        };
        let grad_log_q = merge(self.grad_log_q, other.grad_log_q);
        let grad_log_p = merge(self.grad_log_p, other.grad_log_p);

        Point {
            x: other.x.mask_where(mask_big.clone(), self.x),
            log_q,
            log_p,
            grad_log_q,
            grad_log_p,
        }
    }
}

/// Replaces every invalid particle with a copy of a valid one drawn uniformly with
/// replacement from the valid particles of the batch.
///
/// One donor index is drawn for every particle, valid or not, so the amount of
/// randomness consumed depends only on the batch size.
///
/// # Errors
///
/// Returns [`SmcError::NoValidSamples`] when the whole batch is invalid. Callers must
/// supply batches with at least one valid particle.
pub fn replace_invalid_samples_with_valid_ones<B: Backend>(
    point: Point<B>,
    rng: &mut SmallRng,
) -> Result<Point<B>, SmcError> {
    let valid = point.valid_mask();
    let weights = valid.iter().map(|&v| if v { 1.0 } else { 0.0 });
    let donors = WeightedIndex::new(weights).map_err(|_| SmcError::NoValidSamples)?;

    let indices: Vec<usize> = valid
        .iter()
        .enumerate()
        .map(|(i, &ok)| {
            let donor = donors.sample(rng);
            if ok {
                i
            } else {
                donor
            }
        })
        .collect();

    let n_invalid = valid.iter().filter(|&&ok| !ok).count();
    if n_invalid == 0 {
        return Ok(point);
    }
    tracing::warn!(
        n_invalid,
        batch_size = valid.len(),
        "Replacing invalid samples with valid ones"
    );
    Ok(point.gather(&indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rows_to_tensor;
    use crate::distributions::DiagGaussian;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use rand::SeedableRng;

    type BackendType = Autodiff<NdArray<f64>>;

    fn point_from(x: Vec<f64>, log_q: Vec<f64>, log_p: Vec<f64>) -> Point<BackendType> {
        let n = log_q.len();
        let dim = x.len() / n;
        Point {
            x: rows_to_tensor(x, n, dim, &Default::default()),
            log_q: Array1::from(log_q),
            log_p: Array1::from(log_p),
            grad_log_q: None,
            grad_log_p: None,
        }
    }

    #[test]
    fn test_intermediate_log_prob_endpoints() {
        for &(lq, lp, alpha) in &[(-1.3, -4.2, 2.0), (0.5, -0.1, 1.0), (-7.0, 3.0, 0.5)] {
            assert_abs_diff_eq!(get_intermediate_log_prob(lq, lp, 0.0, alpha), lq, epsilon = 1e-12);
            assert_abs_diff_eq!(
                get_intermediate_log_prob(lq, lp, 1.0, alpha),
                alpha * lp - (alpha - 1.0) * lq,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_weight_contributions_telescope() {
        let betas = [0.0, 0.1, 0.35, 0.8, 1.0];
        let point = point_from(vec![0.0, 0.0, 1.0, 1.0], vec![-1.0, -2.5], vec![-3.0, -0.5]);
        let alpha = 2.0;
        let total = (0..betas.len() - 1)
            .map(|i| log_weight_contribution_point(&point, i, &betas, alpha))
            .fold(Array1::<f64>::zeros(2), |acc, c| acc + c);
        let expected = point.annealed_log_prob(1.0, alpha) - point.annealed_log_prob(0.0, alpha);
        for i in 0..2 {
            assert_abs_diff_eq!(total[i], expected[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_create_point_with_grad() {
        let q = DiagGaussian::standard(2);
        let p = DiagGaussian::new(vec![1.0, 1.0], vec![1.0, 1.0]);
        let x = rows_to_tensor::<BackendType>(vec![0.5, -1.0, 2.0, 0.0], 2, 2, &Default::default());
        let point = create_point(x, &q, &p, true);
        assert!(point.has_grad());
        assert_abs_diff_eq!(point.log_q[0], q.log_prob(&[0.5, -1.0]), epsilon = 1e-10);
        assert_abs_diff_eq!(point.log_p[1], p.log_prob(&[2.0, 0.0]), epsilon = 1e-10);

        // At beta = 1, alpha = 1 the annealed gradient is grad log p = 1 - x.
        let grad = tensor_to_vec(point.annealed_grad(1.0, 1.0).unwrap());
        let expected = [0.5, 2.0, -1.0, 1.0];
        for (g, e) in grad.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*g, *e, epsilon = 1e-10);
        }
        // At beta = 0 it is grad log q = -x.
        let grad = tensor_to_vec(point.annealed_grad(0.0, 2.0).unwrap());
        let expected = [-0.5, 1.0, -2.0, 0.0];
        for (g, e) in grad.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*g, *e, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_valid_mask() {
        let point = point_from(
            vec![0.0, 0.0, f64::NAN, 1.0, 2.0, 2.0, 3.0, 3.0],
            vec![-1.0, -1.0, f64::NEG_INFINITY, -1.0],
            vec![-1.0, -1.0, -1.0, f64::NAN],
        );
        assert_eq!(point.valid_mask(), vec![true, false, false, false]);
    }

    #[test]
    fn test_replace_with_single_valid_particle() {
        let point = point_from(
            vec![f64::NAN, 0.0, 4.0, 5.0, 1.0, f64::INFINITY],
            vec![-1.0, -2.0, -3.0],
            vec![-1.0, -7.0, -3.0],
        );
        let mut rng = SmallRng::seed_from_u64(0);
        let repaired = replace_invalid_samples_with_valid_ones(point, &mut rng).unwrap();
        assert_eq!(tensor_to_vec(repaired.x.clone()), vec![4.0, 5.0, 4.0, 5.0, 4.0, 5.0]);
        assert_eq!(repaired.log_q.to_vec(), vec![-2.0, -2.0, -2.0]);
        assert_eq!(repaired.log_p.to_vec(), vec![-7.0, -7.0, -7.0]);
        assert!(repaired.valid_mask().iter().all(|&v| v));
    }

    #[test]
    fn test_replace_keeps_valid_particles_in_place() {
        let point = point_from(
            vec![0.0, 1.0, 2.0, f64::NAN, 4.0, 5.0],
            vec![-1.0, -2.0, -3.0],
            vec![-1.0, -2.0, -3.0],
        );
        let mut rng = SmallRng::seed_from_u64(3);
        let repaired = replace_invalid_samples_with_valid_ones(point, &mut rng).unwrap();
        let x = tensor_to_vec(repaired.x.clone());
        assert_eq!(&x[0..2], &[0.0, 1.0]);
        assert_eq!(&x[4..6], &[4.0, 5.0]);
        assert!(x[2..4] == [0.0, 1.0] || x[2..4] == [4.0, 5.0]);
    }

    #[test]
    fn test_replace_fails_when_everything_is_invalid() {
        let point = point_from(vec![f64::NAN, 0.0, 0.0, 0.0], vec![-1.0, f64::NAN], vec![-1.0, -1.0]);
        let mut rng = SmallRng::seed_from_u64(0);
        let result = replace_invalid_samples_with_valid_ones(point, &mut rng);
        assert!(matches!(result, Err(SmcError::NoValidSamples)));
    }

    #[test]
    fn test_select_where_mixes_rows() {
        let a = point_from(vec![0.0, 0.0, 1.0, 1.0], vec![-1.0, -2.0], vec![-3.0, -4.0]);
        let b = point_from(vec![9.0, 9.0, 8.0, 8.0], vec![-9.0, -8.0], vec![-7.0, -6.0]);
        let mixed = a.select_where(&[true, false], b);
        assert_eq!(tensor_to_vec(mixed.x), vec![0.0, 0.0, 8.0, 8.0]);
        assert_eq!(mixed.log_q.to_vec(), vec![-1.0, -8.0]);
        assert_eq!(mixed.log_p.to_vec(), vec![-3.0, -6.0]);
    }
}
