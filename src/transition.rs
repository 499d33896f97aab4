//! The contract between the SMC sampler and its MCMC transition operators.
//!
//! Each operator is an independent implementation of [`TransitionOperator`]; the
//! sampler is generic over it. [`TransitionKernel`] is the tagged value used when the
//! operator is chosen from configuration at run time.

use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;

use crate::config::TransitionOperatorConfig;
use crate::distributions::LogProbFn;
use crate::error::SmcError;
use crate::hmc::{Hmc, HmcState};
use crate::metropolis::{Metropolis, MetropolisState};
use crate::point::Point;
use crate::stats::TransitionInfo;

/// An MCMC transition that leaves the annealed density at `beta` invariant.
///
/// The operator owns no mutable state: everything that changes between calls (step
/// size, acceptance statistics, random stream) lives in `State`, which `step` consumes
/// and returns. The SMC sampler keeps one `State` per intermediate distribution.
pub trait TransitionOperator {
    type State: Clone + std::fmt::Debug;

    /// Whether `step` needs points carrying gradients.
    fn uses_grad(&self) -> bool;

    /// Initial tuning state. `rng` seeds the state's own random stream.
    fn init(&self, rng: &mut SmallRng) -> Self::State;

    /// Moves `point` with MCMC targeting the annealed density at `beta` and returns the
    /// moved point, the updated state and diagnostics.
    ///
    /// Non-finite proposals are rejected, never reported as errors.
    fn step<B, Q, P>(
        &self,
        point: Point<B>,
        state: Self::State,
        beta: f64,
        alpha: f64,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> (Point<B>, Self::State, TransitionInfo)
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>;
}

/// Transition operator selected at construction time.
#[derive(Debug, Clone)]
pub enum TransitionKernel {
    Metropolis(Metropolis),
    Hmc(Hmc),
}

/// State of a [`TransitionKernel`]; the variant always matches the kernel's.
#[derive(Debug, Clone)]
pub enum KernelState {
    Metropolis(MetropolisState),
    Hmc(HmcState),
}

impl TransitionKernel {
    /// Builds the operator described by `config`, validating its knobs.
    pub fn from_config(config: &TransitionOperatorConfig) -> Result<Self, SmcError> {
        config.validate()?;
        Ok(match config {
            TransitionOperatorConfig::Metropolis(c) => {
                TransitionKernel::Metropolis(Metropolis::new(c.clone()))
            }
            TransitionOperatorConfig::Hmc(c) => TransitionKernel::Hmc(Hmc::new(c.clone())),
        })
    }
}

impl TransitionOperator for TransitionKernel {
    type State = KernelState;

    fn uses_grad(&self) -> bool {
        match self {
            TransitionKernel::Metropolis(op) => op.uses_grad(),
            TransitionKernel::Hmc(op) => op.uses_grad(),
        }
    }

    fn init(&self, rng: &mut SmallRng) -> KernelState {
        match self {
            TransitionKernel::Metropolis(op) => KernelState::Metropolis(op.init(rng)),
            TransitionKernel::Hmc(op) => KernelState::Hmc(op.init(rng)),
        }
    }

    fn step<B, Q, P>(
        &self,
        point: Point<B>,
        state: KernelState,
        beta: f64,
        alpha: f64,
        log_q_fn: &Q,
        log_p_fn: &P,
    ) -> (Point<B>, KernelState, TransitionInfo)
    where
        B: AutodiffBackend,
        Q: LogProbFn<B>,
        P: LogProbFn<B>,
    {
        match (self, state) {
            (TransitionKernel::Metropolis(op), KernelState::Metropolis(s)) => {
                let (point, s, info) = op.step(point, s, beta, alpha, log_q_fn, log_p_fn);
                (point, KernelState::Metropolis(s), info)
            }
            (TransitionKernel::Hmc(op), KernelState::Hmc(s)) => {
                let (point, s, info) = op.step(point, s, beta, alpha, log_q_fn, log_p_fn);
                (point, KernelState::Hmc(s), info)
            }
            (kernel, state) => panic!(
                "transition state {state:?} does not belong to kernel {kernel:?}"
            ),
        }
    }
}

/// Running mean of per-iteration batch acceptance rates, accumulated across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcceptanceHistory {
    pub mean: f64,
    pub count: usize,
}

impl AcceptanceHistory {
    pub fn record(&mut self, p_accept: f64) {
        self.count += 1;
        self.mean += (p_accept - self.mean) / self.count as f64;
    }
}

/// Upper bound on tuned step sizes. Keeps the controller out of `inf`, from which
/// dividing by the multiplier can never recover.
pub(crate) const MAX_STEP_SIZE: f64 = 1e8;

/// Multiplicative step-size controller shared by both operators: grow the step when
/// the batch accepts more often than targeted, shrink it otherwise.
pub(crate) fn tune_step_size(step_size: f64, p_accept: f64, target_p_accept: f64, multiplier: f64) -> f64 {
    let tuned = if p_accept > target_p_accept {
        step_size * multiplier
    } else {
        step_size / multiplier
    };
    tuned.clamp(f64::MIN_POSITIVE, MAX_STEP_SIZE)
}

/// Sets the log acceptance ratio of every invalid proposal to `-inf`.
///
/// An invalid proposal can still have a `+inf` annealed density (for instance
/// `log_q = -inf` with a negative `log_q` coefficient), which would otherwise be
/// accepted with probability one.
pub(crate) fn reject_invalid(
    mut log_accept: ndarray::Array1<f64>,
    proposal_valid: &[bool],
) -> ndarray::Array1<f64> {
    for (a, &valid) in log_accept.iter_mut().zip(proposal_valid) {
        if !valid {
            *a = f64::NEG_INFINITY;
        }
    }
    log_accept
}

/// Per-particle acceptance probabilities `min(1, exp(log_accept))`, with non-finite
/// (NaN) ratios mapped to zero.
pub(crate) fn acceptance_probabilities(log_accept: &ndarray::Array1<f64>) -> ndarray::Array1<f64> {
    log_accept.mapv(|a| if a.is_nan() { 0.0 } else { a.min(0.0).exp() })
}

/// Accept decisions `log u <= log_accept`. NaN and `-inf` ratios are rejections, even
/// for `u = 0`.
pub(crate) fn accept_mask(log_accept: &ndarray::Array1<f64>, log_u: &ndarray::Array1<f64>) -> Vec<bool> {
    log_accept
        .iter()
        .zip(log_u.iter())
        .map(|(&a, &u)| a > f64::NEG_INFINITY && a >= u)
        .collect()
}
