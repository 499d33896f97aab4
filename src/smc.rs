//! Sequential Monte Carlo (and, without resampling, annealed importance sampling)
//! from the base distribution `q` towards the alpha-divergence target
//! `alpha * log_p - (alpha - 1) * log_q`.
//!
//! The sampler walks a fixed schedule of intermediate distributions. At every stage it
//! optionally resamples, moves the particles with the transition operator of that
//! stage, reverts particles the move made invalid and accumulates the importance
//! weight increment.
//!
//! # Examples
//!
//! ```rust
//! use burn::backend::{Autodiff, NdArray};
//! use fab_smc::config::{MetropolisConfig, SpacingType};
//! use fab_smc::distributions::DiagGaussian;
//! use fab_smc::metropolis::Metropolis;
//! use fab_smc::smc::build_smc;
//! use rand::{rngs::SmallRng, SeedableRng};
//!
//! type BackendType = Autodiff<NdArray<f64>>;
//!
//! let q = DiagGaussian::standard(2);
//! let p = DiagGaussian::new(vec![1.0, 1.0], vec![1.0, 1.0]);
//! let sampler = build_smc(
//!     Metropolis::new(MetropolisConfig::default()),
//!     4,
//!     SpacingType::Linear,
//!     2.0,
//!     true,
//!     0.3,
//! )
//! .unwrap();
//!
//! let mut rng = SmallRng::seed_from_u64(42);
//! let state = sampler.init(&mut rng);
//! let x0 = q.sample::<BackendType>(&mut rng, 64, &Default::default());
//! let (point, log_w, _state, info) = sampler.step(x0, state, &q, &p).unwrap();
//! assert_eq!(point.batch_size(), 64);
//! assert_eq!(log_w.len(), 64);
//! assert_eq!(info.stages.len(), 4);
//! ```

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;

use crate::config::{validate_sampler, SmcConfig, SpacingType};
use crate::core::{finite_rows, split_rng, tensor_to_vec};
use crate::distributions::LogProbFn;
use crate::error::SmcError;
use crate::point::{
    create_point, log_weight_contribution_point, replace_invalid_samples_with_valid_ones, Point,
};
use crate::resampling::{log_effective_sample_size, optionally_resample, should_resample};
use crate::stats::{SmcInfo, StageInfo};
use crate::transition::{TransitionKernel, TransitionOperator};

/// Mutable state of the sampler, threaded through successive calls to
/// [`SmcSampler::step`].
#[derive(Debug, Clone)]
pub struct SmcState<S> {
    /// One operator state per intermediate distribution.
    pub transition_operator_states: Vec<S>,
    /// Stream from which repair and resampling generators are split.
    pub rng: SmallRng,
}

/// An SMC/AIS sampler over a fixed annealing schedule.
#[derive(Debug, Clone)]
pub struct SmcSampler<Op> {
    pub transition_operator: Op,
    /// Annealing schedule of length `n_intermediate_distributions + 2`, from 0 to 1.
    pub betas: Vec<f64>,
    pub alpha: f64,
    pub use_resampling: bool,
    pub resampling_threshold: f64,
    pub n_intermediate_distributions: usize,
}

/// Annealing schedule with `n_intermediate_distributions + 2` points, starting at
/// exactly 0 and ending at exactly 1.
///
/// # Errors
///
/// [`SmcError::InvalidConfig`] when `n_intermediate_distributions` is zero.
pub fn make_betas(
    n_intermediate_distributions: usize,
    spacing_type: SpacingType,
) -> Result<Vec<f64>, SmcError> {
    let n = n_intermediate_distributions;
    if n == 0 {
        return Err(SmcError::InvalidConfig(
            "n_intermediate_distributions must be at least 1".into(),
        ));
    }
    let mut betas: Vec<f64> = match spacing_type {
        SpacingType::Linear => (0..n + 2).map(|i| i as f64 / (n + 1) as f64).collect(),
        SpacingType::Geometric => {
            let n_linspace = n / 4;
            let n_geomspace = n - n_linspace + 1;
            let linear_part = (0..=n_linspace).map(|i| 0.01 * i as f64 / (n_linspace + 1) as f64);
            let geometric_part = (0..n_geomspace).map(|k| {
                let exponent = -2.0 + 2.0 * k as f64 / (n_geomspace - 1) as f64;
                10f64.powf(exponent)
            });
            linear_part.chain(geometric_part).collect()
        }
    };
    betas[0] = 0.0;
    if let Some(last) = betas.last_mut() {
        *last = 1.0;
    }
    Ok(betas)
}

/// Builds a sampler around `transition_operator`.
///
/// # Errors
///
/// [`SmcError::InvalidConfig`] for zero intermediate distributions, a non-finite
/// `alpha` or a `resampling_threshold` outside `(0, 1]`.
pub fn build_smc<Op: TransitionOperator>(
    transition_operator: Op,
    n_intermediate_distributions: usize,
    spacing_type: SpacingType,
    alpha: f64,
    use_resampling: bool,
    resampling_threshold: f64,
) -> Result<SmcSampler<Op>, SmcError> {
    validate_sampler(n_intermediate_distributions, alpha, resampling_threshold)?;
    let betas = make_betas(n_intermediate_distributions, spacing_type)?;
    Ok(SmcSampler {
        transition_operator,
        betas,
        alpha,
        use_resampling,
        resampling_threshold,
        n_intermediate_distributions,
    })
}

impl SmcSampler<TransitionKernel> {
    /// Builds a sampler whose operator is chosen by `config.transition_operator`.
    pub fn from_config(config: &SmcConfig) -> Result<Self, SmcError> {
        config.validate()?;
        let kernel = TransitionKernel::from_config(&config.transition_operator)?;
        build_smc(
            kernel,
            config.n_intermediate_distributions,
            config.spacing_type,
            config.alpha,
            config.use_resampling,
            config.resampling_threshold,
        )
    }
}

impl<Op: TransitionOperator> SmcSampler<Op> {
    /// Fresh sampler state: one operator state per intermediate distribution, each with
    /// its own random stream.
    pub fn init(&self, rng: &mut SmallRng) -> SmcState<Op::State> {
        let transition_operator_states = (0..self.n_intermediate_distributions)
            .map(|_| self.transition_operator.init(rng))
            .collect();
        SmcState {
            transition_operator_states,
            rng: split_rng(rng),
        }
    }

    /// Runs one forward pass from the initial positions `x0 ~ q`.
    ///
    /// Returns the final particles, their log importance weights, the updated state and
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// - [`SmcError::NoValidSamples`] if no initial particle is valid.
    /// - [`SmcError::DegenerateWeights`] if resampling meets weights with no finite mass.
    ///
    /// # Panics
    ///
    /// If `x0` is empty or `state` holds the wrong number of operator states.
    #[allow(clippy::type_complexity)]
    pub fn step<B, Q, P>(
        &self,
        x0: Tensor<B, 2>,
        state: SmcState<Op::State>,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> Result<(Point<B>, Array1<f64>, SmcState<Op::State>, SmcInfo), SmcError>
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>,
    {
        let n_particles = x0.dims()[0];
        assert!(n_particles > 0, "x0 must contain at least one particle");
        assert_eq!(
            state.transition_operator_states.len(),
            self.n_intermediate_distributions,
            "expected one transition operator state per intermediate distribution"
        );
        let SmcState {
            transition_operator_states,
            mut rng,
        } = state;

        let point = create_point(
            x0,
            log_q_fn,
            log_p_fn,
            self.transition_operator.uses_grad(),
        );
        let mut repair_rng = split_rng(&mut rng);
        let mut point = replace_invalid_samples_with_valid_ones(point, &mut repair_rng)?;

        let log_ess_q_p = log_effective_sample_size((&point.log_p - &point.log_q).view());
        let mut log_w = log_weight_contribution_point(&point, 0, &self.betas, self.alpha);

        let mut new_states = Vec::with_capacity(self.n_intermediate_distributions);
        let mut stages = Vec::with_capacity(self.n_intermediate_distributions);

        for (i, op_state) in transition_operator_states.into_iter().enumerate() {
            let stage = i + 1;
            let beta = self.betas[stage];

            let (mut ess, mut ess_after_resampling, mut resampled) = (None, None, false);
            if self.use_resampling {
                let mut stage_rng = split_rng(&mut rng);
                let (resampled_point, resampled_log_w, log_ess) = optionally_resample(
                    &mut stage_rng,
                    log_w,
                    point,
                    self.resampling_threshold,
                )?;
                point = resampled_point;
                log_w = resampled_log_w;
                resampled = should_resample(log_ess, n_particles, self.resampling_threshold);
                ess = Some(log_ess.exp());
                ess_after_resampling = Some(log_effective_sample_size(log_w.view()).exp());
            }

            let previous = point.clone();
            let (moved, new_state, transition) = self.transition_operator.step(
                point,
                op_state,
                beta,
                self.alpha,
                log_q_fn,
                log_p_fn,
            );

            let valid = moved.valid_mask();
            let n_reverted = valid.iter().filter(|&&ok| !ok).count();
            point = if n_reverted > 0 {
                tracing::warn!(
                    stage,
                    n_reverted,
                    "Reverting particles made invalid by the transition"
                );
                moved.select_where(&valid, previous)
            } else {
                moved
            };

            log_w = log_w + log_weight_contribution_point(&point, stage, &self.betas, self.alpha);

            tracing::debug!(
                stage,
                beta,
                ess = ?ess,
                resampled,
                acceptance = transition.mean_acceptance_rate,
                step_size = transition.step_size,
                "SMC stage"
            );
            stages.push(StageInfo {
                beta,
                ess,
                ess_after_resampling,
                resampled,
                n_reverted,
                transition,
            });
            new_states.push(new_state);
        }
        assert_eq!(
            new_states.len(),
            self.n_intermediate_distributions,
            "transition operator states were lost during the pass"
        );

        let x_host = tensor_to_vec(point.x.clone());
        let n_finite_samples = finite_rows(&x_host, point.dim())
            .iter()
            .zip(log_w.iter())
            .filter(|(x_ok, w)| **x_ok && w.is_finite())
            .count();
        let max_abs_x = *Array1::from(x_host).mapv(f64::abs).max_skipnan();
        let log_ess_smc_final = log_effective_sample_size(log_w.view());

        let info = SmcInfo {
            stages,
            log_ess_q_p,
            ess_q_p: log_ess_q_p.exp(),
            log_ess_smc_final,
            ess_smc_final: log_ess_smc_final.exp(),
            n_finite_samples,
            max_abs_x,
        };
        let state = SmcState {
            transition_operator_states: new_states,
            rng,
        };
        Ok((point, log_w, state, info))
    }
}
