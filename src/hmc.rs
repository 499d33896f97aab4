//! Hamiltonian Monte Carlo on the annealed density, using the `burn` crate for autodiff.
//!
//! The update works in a data-parallel fashion: all particles draw momenta, follow
//! their own leapfrog trajectory and are accepted or rejected independently, while
//! sharing a single step size. Gradients of the annealed density are assembled from
//! the per-density gradients stored on each [`Point`], so the flow and the target are
//! each differentiated once per leapfrog position.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;

use crate::config::HmcConfig;
use crate::core::{log_uniform, rows_to_tensor, split_rng, standard_normal, tensor_to_array1};
use crate::distributions::LogProbFn;
use crate::point::{create_point, Point};
use crate::stats::TransitionInfo;
use crate::transition::{
    accept_mask, acceptance_probabilities, reject_invalid, tune_step_size, AcceptanceHistory,
    TransitionOperator,
};

/// A batched HMC transition operator with a diagonal mass matrix.
#[derive(Debug, Clone)]
pub struct Hmc {
    pub config: HmcConfig,
}

/// Mutable state of [`Hmc`] for one intermediate distribution.
#[derive(Debug, Clone)]
pub struct HmcState {
    /// Current leapfrog step size.
    pub step_size: f64,
    /// Diagonal of the inverse mass matrix. Unit mass when absent.
    pub inverse_mass_diag: Option<Vec<f64>>,
    /// Acceptance probabilities observed over all calls so far.
    pub acceptance: AcceptanceHistory,
    /// Random stream for momenta and accept/reject draws.
    pub rng: SmallRng,
}

impl Hmc {
    /// Creates an HMC operator.
    ///
    /// # Parameters
    ///
    /// * `config`: Outer and inner (leapfrog) step counts, initial step size, step-size
    ///   adaptation and an optional inverse mass diagonal.
    ///
    /// # Returns
    ///
    /// An operator whose per-stage states come from [`TransitionOperator::init`].
    pub fn new(config: HmcConfig) -> Self {
        Self { config }
    }

    /// Runs `n_inner_steps` leapfrog steps from `point` with momentum `momentum`.
    ///
    /// Each step performs:
    /// - A half-step update of the momentum.
    /// - A full-step update of the positions, scaled by the inverse mass.
    /// - Another half-step update of the momentum at the new positions.
    ///
    /// Returns the end point (with gradients) and the final momentum.
    #[allow(clippy::too_many_arguments)]
    fn leapfrog<B, Q, P>(
        &self,
        point: Point<B>,
        mut momentum: Tensor<B, 2>,
        step_size: f64,
        inverse_mass: &Tensor<B, 2>,
        beta: f64,
        alpha: f64,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> (Point<B>, Tensor<B, 2>)
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>,
    {
        let half = 0.5 * step_size;
        let mut current = point;
        for _ in 0..self.config.n_inner_steps {
            momentum = momentum.add(annealed_grad(&current, beta, alpha).mul_scalar(half));

            let x = current
                .x
                .clone()
                .add(momentum.clone().mul(inverse_mass.clone()).mul_scalar(step_size));
            current = create_point(x, log_q_fn, log_p_fn, true);

            momentum = momentum.add(annealed_grad(&current, beta, alpha).mul_scalar(half));
        }
        (current, momentum)
    }
}

/// Diagonal of the inverse mass matrix for a `dim`-dimensional problem.
///
/// # Panics
///
/// If a configured diagonal does not have `dim` entries.
fn inverse_mass(diag: Option<&[f64]>, dim: usize) -> Vec<f64> {
    match diag {
        Some(diag) => {
            assert_eq!(
                diag.len(),
                dim,
                "inverse_mass_diag has {} entries but particles have dimension {dim}",
                diag.len()
            );
            diag.to_vec()
        }
        None => vec![1.0; dim],
    }
}

/// Gradient of the annealed density; zero if the point carries no gradients.
fn annealed_grad<B: Backend>(point: &Point<B>, beta: f64, alpha: f64) -> Tensor<B, 2> {
    point
        .annealed_grad(beta, alpha)
        .unwrap_or_else(|| Tensor::zeros(point.x.dims(), &point.x.device()))
}

/// Kinetic energy `0.5 * sum_d p_d^2 * inv_mass_d` for each particle.
fn kinetic_energy<B: Backend>(momentum: &Tensor<B, 2>, inverse_mass: &Tensor<B, 2>) -> Array1<f64> {
    let ke = momentum
        .clone()
        .powi_scalar(2)
        .mul(inverse_mass.clone())
        .sum_dim(1)
        .squeeze::<1>(1)
        .mul_scalar(0.5);
    tensor_to_array1(ke)
}

impl TransitionOperator for Hmc {
    type State = HmcState;

    fn uses_grad(&self) -> bool {
        true
    }

    fn init(&self, rng: &mut SmallRng) -> HmcState {
        HmcState {
            step_size: self.config.init_step_size,
            inverse_mass_diag: self.config.inverse_mass_diag.clone(),
            acceptance: AcceptanceHistory::default(),
            rng: split_rng(rng),
        }
    }

    /// Performs `n_outer_steps` HMC updates for all particles in parallel.
    ///
    /// Each update consists of:
    /// 1) Sampling momenta `p ~ N(0, M)`.
    /// 2) Running the leapfrog integrator to propose new positions.
    /// 3) Accepting each proposal with probability `min(1, exp(H_current - H_proposed))`.
    /// 4) Adapting the step size, if enabled.
    fn step<B, Q, P>(
        &self,
        point: Point<B>,
        mut state: HmcState,
        beta: f64,
        alpha: f64,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> (Point<B>, HmcState, TransitionInfo)
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>,
    {
        let (n, dim) = (point.batch_size(), point.dim());
        let device = point.x.device();

        let inv_mass = inverse_mass(state.inverse_mass_diag.as_deref(), dim);
        let sqrt_inv_mass: Vec<f64> = inv_mass.iter().map(|m| m.sqrt()).collect();
        let repeat = |v: &[f64]| -> Vec<f64> { (0..n).flat_map(|_| v.iter().copied()).collect() };
        let inv_mass_t = rows_to_tensor::<B>(repeat(&inv_mass), n, dim, &device);
        let sqrt_inv_mass_t = rows_to_tensor::<B>(repeat(&sqrt_inv_mass), n, dim, &device);

        let mut current = if point.has_grad() {
            point
        } else {
            create_point(point.x, log_q_fn, log_p_fn, true)
        };

        let mut acceptance_sum = 0.0;
        let mut energy_error_sum = 0.0;
        let mut energy_error_count = 0usize;

        for _ in 0..self.config.n_outer_steps {
            // 1) Momenta with covariance M = diag(1 / inv_mass).
            let noise = standard_normal::<B>(&mut state.rng, n, dim, &device);
            let momentum = noise.div(sqrt_inv_mass_t.clone());

            let h_current =
                kinetic_energy(&momentum, &inv_mass_t) - current.annealed_log_prob(beta, alpha);

            // 2) Leapfrog trajectory.
            let (proposed, momentum) = self.leapfrog(
                current.clone(),
                momentum,
                state.step_size,
                &inv_mass_t,
                beta,
                alpha,
                log_q_fn,
                log_p_fn,
            );
            let h_proposed =
                kinetic_energy(&momentum, &inv_mass_t) - proposed.annealed_log_prob(beta, alpha);

            // 3) Accept/reject.
            let log_accept = reject_invalid(&h_current - &h_proposed, &proposed.valid_mask());
            for e in log_accept.iter().filter(|e| e.is_finite()) {
                energy_error_sum += e.abs();
                energy_error_count += 1;
            }
            let log_u = log_uniform(&mut state.rng, n);
            let accepted = accept_mask(&log_accept, &log_u);
            let p_accept = acceptance_probabilities(&log_accept)
                .mean()
                .unwrap_or(0.0);
            acceptance_sum += p_accept;
            state.acceptance.record(p_accept);

            current = proposed.select_where(&accepted, current);

            // 4) Step-size adaptation.
            if self.config.adapt_step_size {
                state.step_size = tune_step_size(
                    state.step_size,
                    p_accept,
                    self.config.target_p_accept,
                    self.config.step_size_multiplier,
                );
            }
        }

        let mean_acceptance_rate = acceptance_sum / self.config.n_outer_steps as f64;
        let mean_abs_energy_error = if energy_error_count > 0 {
            energy_error_sum / energy_error_count as f64
        } else {
            f64::NAN
        };
        tracing::trace!(
            beta,
            mean_acceptance_rate,
            step_size = state.step_size,
            mean_abs_energy_error,
            "HMC transition"
        );
        let info = TransitionInfo {
            mean_acceptance_rate,
            step_size: state.step_size,
            extra: BTreeMap::from([
                (
                    "n_leapfrog".to_string(),
                    (self.config.n_outer_steps * self.config.n_inner_steps) as f64,
                ),
                ("mean_abs_energy_error".to_string(), mean_abs_energy_error),
            ]),
        };
        (current, state, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tensor_to_vec;
    use crate::distributions::{DiagGaussian, Truncated};
    use burn::backend::{Autodiff, NdArray};
    use rand::SeedableRng;

    type BackendType = Autodiff<NdArray<f64>>;

    fn start(n: usize, dim: usize, seed: u64) -> (DiagGaussian, Tensor<BackendType, 2>) {
        let q = DiagGaussian::standard(dim);
        let mut rng = SmallRng::seed_from_u64(seed);
        let x = q.sample::<BackendType>(&mut rng, n, &Default::default());
        (q, x)
    }

    fn column_means(x: &[f64], dim: usize) -> Vec<f64> {
        let n = x.len() / dim;
        (0..dim)
            .map(|d| x.iter().skip(d).step_by(dim).sum::<f64>() / n as f64)
            .collect()
    }

    #[test]
    fn test_hmc_moves_towards_target() {
        let (q, x) = start(300, 3, 5);
        let p = DiagGaussian::new(vec![2.0, -1.0, 0.5], vec![1.0, 1.0, 1.0]);
        let op = Hmc::new(HmcConfig {
            n_outer_steps: 30,
            n_inner_steps: 5,
            init_step_size: 0.3,
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(0);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &p, true);

        let (point, _, info) = op.step(point, state, 1.0, 1.0, &q, &p);

        let means = column_means(&tensor_to_vec(point.x.clone()), 3);
        for (m, target) in means.iter().zip([2.0, -1.0, 0.5]) {
            assert!((m - target).abs() < 0.25, "mean {m} vs {target}");
        }
        assert!(point.has_grad());
        assert!(info.mean_acceptance_rate > 0.3);
        assert_eq!(info.extra["n_leapfrog"], 150.0);
    }

    #[test]
    fn test_small_steps_are_almost_always_accepted() {
        let (q, x) = start(100, 2, 1);
        let op = Hmc::new(HmcConfig {
            init_step_size: 1e-3,
            adapt_step_size: false,
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(1);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, true);
        let (_, state, info) = op.step(point, state, 0.5, 2.0, &q, &q);
        assert!(info.mean_acceptance_rate > 0.99);
        assert!(info.extra["mean_abs_energy_error"] < 1e-4);
        assert_eq!(state.step_size, 1e-3);
    }

    #[test]
    fn test_step_size_grows_when_acceptance_is_high() {
        let (q, x) = start(64, 2, 2);
        let op = Hmc::new(HmcConfig {
            init_step_size: 1e-3,
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(2);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, true);
        let (_, state, _) = op.step(point, state, 0.0, 2.0, &q, &q);
        assert!((state.step_size - 1.1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_point_without_grad_is_accepted() {
        let (q, x) = start(16, 2, 3);
        let p = DiagGaussian::new(vec![1.0, 1.0], vec![1.0, 1.0]);
        let op = Hmc::new(HmcConfig::default());
        let mut rng = SmallRng::seed_from_u64(3);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &p, false);
        let (point, _, _) = op.step(point, state, 0.5, 2.0, &q, &p);
        assert!(point.has_grad());
        assert_eq!(point.batch_size(), 16);
    }

    #[test]
    fn test_inverse_mass_scales_motion() {
        // With a tiny inverse mass along the second axis, positions barely move there.
        let (q, x) = start(50, 2, 4);
        let before = tensor_to_vec(x.clone());
        let op = Hmc::new(HmcConfig {
            inverse_mass_diag: Some(vec![1.0, 1e-8]),
            adapt_step_size: false,
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(4);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, true);
        let (point, _, _) = op.step(point, state, 0.0, 2.0, &q, &q);
        let after = tensor_to_vec(point.x);
        let moved_second: f64 = before
            .iter()
            .zip(after.iter())
            .skip(1)
            .step_by(2)
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(moved_second < 1e-2, "moved {moved_second}");
    }

    /// A trajectory ending beyond the truncation has `H = -inf` at `alpha = 2, beta = 1`
    /// and must be rejected rather than accepted with probability one.
    #[test]
    fn test_trajectories_outside_support_are_rejected() {
        let q = Truncated {
            inner: DiagGaussian::standard(2),
            bound: 1.0,
        };
        let p = DiagGaussian::new(vec![3.0, 0.0], vec![1.0, 1.0]);
        let (_, x) = start(200, 2, 6);
        let point = create_point(x.clamp_max(0.5), &q, &p, true);
        let op = Hmc::new(HmcConfig {
            n_outer_steps: 1,
            n_inner_steps: 1,
            init_step_size: 1e3,
            adapt_step_size: false,
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(6);
        let state = op.init(&mut rng);

        let (point, state, info) = op.step(point, state, 1.0, 2.0, &q, &p);

        assert!(point.valid_mask().iter().all(|&v| v));
        assert!(tensor_to_vec(point.x).iter().step_by(2).all(|&x0| x0 <= 1.0));
        assert!(info.mean_acceptance_rate < 0.05, "{}", info.mean_acceptance_rate);
        assert!(state.acceptance.mean < 0.05);
    }

    #[test]
    #[should_panic(expected = "inverse_mass_diag")]
    fn test_inverse_mass_dimension_mismatch_panics() {
        let (q, x) = start(4, 2, 5);
        let op = Hmc::new(HmcConfig {
            inverse_mass_diag: Some(vec![1.0, 1.0, 1.0]),
            ..HmcConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(5);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, true);
        let _ = op.step(point, state, 0.5, 2.0, &q, &q);
    }
}
