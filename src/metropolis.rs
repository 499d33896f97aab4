//! Random-walk Metropolis on the annealed density.
//!
//! Every particle proposes `x' = x + step_size * eps` with `eps ~ N(0, I)` and is
//! accepted with probability `min(1, exp(log pi_beta(x') - log pi_beta(x)))`. The whole
//! batch shares one step size, which is optionally tuned towards a target acceptance
//! rate after every inner iteration.

use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;

use crate::config::MetropolisConfig;
use crate::core::{log_uniform, split_rng, standard_normal};
use crate::distributions::LogProbFn;
use crate::point::{create_point, Point};
use crate::stats::TransitionInfo;
use crate::transition::{
    accept_mask, acceptance_probabilities, reject_invalid, tune_step_size, AcceptanceHistory,
    TransitionOperator,
};

/// Batched random-walk Metropolis transition operator.
#[derive(Debug, Clone)]
pub struct Metropolis {
    pub config: MetropolisConfig,
}

/// Mutable state of [`Metropolis`] for one intermediate distribution.
#[derive(Debug, Clone)]
pub struct MetropolisState {
    /// Current proposal standard deviation.
    pub step_size: f64,
    /// Acceptance rates observed over all calls so far.
    pub acceptance: AcceptanceHistory,
    /// Random stream for proposals and accept/reject draws.
    pub rng: SmallRng,
}

impl Metropolis {
    /// Creates a Metropolis operator.
    ///
    /// # Parameters
    ///
    /// * `config`: Number of inner steps, initial step size and tuning controls.
    ///
    /// # Returns
    ///
    /// An operator whose per-stage states come from [`TransitionOperator::init`].
    pub fn new(config: MetropolisConfig) -> Self {
        Self { config }
    }
}

impl TransitionOperator for Metropolis {
    type State = MetropolisState;

    fn uses_grad(&self) -> bool {
        false
    }

    fn init(&self, rng: &mut SmallRng) -> MetropolisState {
        MetropolisState {
            step_size: self.config.init_step_size,
            acceptance: AcceptanceHistory::default(),
            rng: split_rng(rng),
        }
    }

    fn step<B, Q, P>(
        &self,
        point: Point<B>,
        mut state: MetropolisState,
        beta: f64,
        alpha: f64,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> (Point<B>, MetropolisState, TransitionInfo)
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>,
    {
        let (n, dim) = (point.batch_size(), point.dim());
        let device = point.x.device();
        let mut current = point;
        let mut acceptance_sum = 0.0;

        for _ in 0..self.config.n_steps {
            let noise = standard_normal::<B>(&mut state.rng, n, dim, &device);
            let x_proposed = current.x.clone().add(noise.mul_scalar(state.step_size));
            let proposed = create_point(x_proposed, log_q_fn, log_p_fn, false);

            let log_accept = reject_invalid(
                proposed.annealed_log_prob(beta, alpha) - current.annealed_log_prob(beta, alpha),
                &proposed.valid_mask(),
            );
            let log_u = log_uniform(&mut state.rng, n);
            let accepted = accept_mask(&log_accept, &log_u);

            let p_accept = acceptance_probabilities(&log_accept)
                .mean()
                .unwrap_or(0.0);
            acceptance_sum += p_accept;
            state.acceptance.record(p_accept);

            current = proposed.select_where(&accepted, current);

            if self.config.tune_step_size {
                state.step_size = tune_step_size(
                    state.step_size,
                    p_accept,
                    self.config.target_p_accept,
                    self.config.step_size_multiplier,
                );
            }
        }

        let mean_acceptance_rate = acceptance_sum / self.config.n_steps as f64;
        tracing::trace!(
            beta,
            mean_acceptance_rate,
            step_size = state.step_size,
            "Metropolis transition"
        );
        let info = TransitionInfo {
            mean_acceptance_rate,
            step_size: state.step_size,
            extra: BTreeMap::from([("n_steps".to_string(), self.config.n_steps as f64)]),
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
    use burn::prelude::*;
    use rand::SeedableRng;

    type BackendType = Autodiff<NdArray<f64>>;

    fn start(n: usize, dim: usize) -> (DiagGaussian, Tensor<BackendType, 2>) {
        let q = DiagGaussian::standard(dim);
        let mut rng = SmallRng::seed_from_u64(11);
        let x = q.sample::<BackendType>(&mut rng, n, &Default::default());
        (q, x)
    }

    #[test]
    fn test_metropolis_moves_towards_target() {
        let (q, x) = start(500, 2);
        let p = DiagGaussian::new(vec![3.0, -2.0], vec![0.5, 0.5]);
        let op = Metropolis::new(MetropolisConfig {
            n_steps: 200,
            init_step_size: 0.5,
            ..MetropolisConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(0);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &p, false);

        // alpha = 1, beta = 1 targets p exactly.
        let (point, state, info) = op.step(point, state, 1.0, 1.0, &q, &p);

        let x = tensor_to_vec(point.x.clone());
        let mean0 = x.iter().step_by(2).sum::<f64>() / 500.0;
        let mean1 = x.iter().skip(1).step_by(2).sum::<f64>() / 500.0;
        assert!((mean0 - 3.0).abs() < 0.2, "mean0 = {mean0}");
        assert!((mean1 + 2.0).abs() < 0.2, "mean1 = {mean1}");
        assert!(info.mean_acceptance_rate > 0.2 && info.mean_acceptance_rate < 1.0);
        assert_eq!(info.step_size, state.step_size);
        assert_eq!(info.extra["n_steps"], 200.0);
        assert_eq!(state.acceptance.count, 200);
        // Stored densities stay consistent with the positions.
        assert!((point.log_p[0] - p.log_prob(&x[0..2])).abs() < 1e-9);
    }

    #[test]
    fn test_huge_step_size_is_tuned_down() {
        let (q, x) = start(200, 2);
        let op = Metropolis::new(MetropolisConfig {
            n_steps: 10,
            init_step_size: 1e3,
            ..MetropolisConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(1);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, false);
        let (_, state, info) = op.step(point, state, 0.5, 2.0, &q, &q);
        assert!(state.step_size < 1e3);
        assert!(info.mean_acceptance_rate < 0.65);
    }

    #[test]
    fn test_tuning_can_be_disabled() {
        let (q, x) = start(50, 1);
        let op = Metropolis::new(MetropolisConfig {
            n_steps: 5,
            init_step_size: 0.3,
            tune_step_size: false,
            ..MetropolisConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(2);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &q, false);
        let (_, state, _) = op.step(point, state, 0.3, 2.0, &q, &q);
        assert_eq!(state.step_size, 0.3);
    }

    /// With `alpha = 2, beta = 1` the `log_q` coefficient is negative, so a proposal
    /// beyond the truncation has annealed density `+inf`. It must still be rejected.
    #[test]
    fn test_proposals_outside_support_are_rejected() {
        let q = Truncated {
            inner: DiagGaussian::standard(2),
            bound: 1.0,
        };
        let p = DiagGaussian::new(vec![3.0, 0.0], vec![1.0, 1.0]);
        let (_, x) = start(200, 2);
        let point = create_point(x.clamp_max(0.5), &q, &p, false);
        let op = Metropolis::new(MetropolisConfig {
            n_steps: 1,
            init_step_size: 1e3,
            tune_step_size: false,
            ..MetropolisConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(4);
        let state = op.init(&mut rng);

        let (point, state, info) = op.step(point, state, 1.0, 2.0, &q, &p);

        assert!(point.valid_mask().iter().all(|&v| v));
        assert!(tensor_to_vec(point.x).iter().step_by(2).all(|&x0| x0 <= 1.0));
        // Roughly half the proposals cross the bound; none of them count as accepted.
        assert!(info.mean_acceptance_rate < 0.05, "{}", info.mean_acceptance_rate);
        assert!(state.acceptance.mean < 0.05);
    }

    #[test]
    fn test_tuning_near_support_keeps_points_valid() {
        let q = Truncated {
            inner: DiagGaussian::standard(2),
            bound: 1.0,
        };
        let p = DiagGaussian::new(vec![3.0, 0.0], vec![1.0, 1.0]);
        let (_, x) = start(100, 2);
        let point = create_point(x.clamp_max(0.5), &q, &p, false);
        let op = Metropolis::new(MetropolisConfig {
            n_steps: 50,
            init_step_size: 1.0,
            ..MetropolisConfig::default()
        });
        let mut rng = SmallRng::seed_from_u64(5);
        let state = op.init(&mut rng);

        let (point, state, _) = op.step(point, state, 1.0, 2.0, &q, &p);

        assert!(point.valid_mask().iter().all(|&v| v));
        assert!(state.step_size.is_finite());
    }

    #[test]
    fn test_same_state_gives_same_result() {
        let (q, x) = start(20, 2);
        let p = DiagGaussian::new(vec![1.0, 1.0], vec![1.0, 1.0]);
        let op = Metropolis::new(MetropolisConfig::default());
        let mut rng = SmallRng::seed_from_u64(3);
        let state = op.init(&mut rng);
        let point = create_point(x, &q, &p, false);
        let (a, _, _) = op.step(point.clone(), state.clone(), 0.4, 2.0, &q, &p);
        let (b, _, _) = op.step(point, state, 0.4, 2.0, &q, &p);
        assert_eq!(tensor_to_vec(a.x), tensor_to_vec(b.x));
    }
}
