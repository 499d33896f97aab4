//! Sampler configuration, deserializable from TOML.
//!
//! ```toml
//! n_intermediate_distributions = 8
//! spacing_type = "geometric"
//! alpha = 2.0
//! use_resampling = true
//! resampling_threshold = 0.3
//!
//! [transition_operator]
//! type = "hmc"
//! n_inner_steps = 5
//! init_step_size = 0.1
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::SmcError;

/// Spacing of the annealing schedule `betas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpacingType {
    /// `betas` evenly spaced on `[0, 1]`.
    #[default]
    Linear,
    /// A quarter of the points evenly spaced on `[0, 0.01)`, the rest geometrically
    /// spaced from `0.01` to `1`.
    Geometric,
}

impl FromStr for SpacingType {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(SpacingType::Linear),
            "geometric" => Ok(SpacingType::Geometric),
            other => Err(SmcError::UnknownSpacingType(other.to_string())),
        }
    }
}

impl fmt::Display for SpacingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpacingType::Linear => write!(f, "linear"),
            SpacingType::Geometric => write!(f, "geometric"),
        }
    }
}

/// Random-walk Metropolis knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetropolisConfig {
    /// Accept/reject iterations per call.
    #[serde(default = "default_n_steps")]
    pub n_steps: usize,

    /// Initial standard deviation of the isotropic Gaussian proposal.
    #[serde(default = "default_metropolis_step_size")]
    pub init_step_size: f64,

    /// Whether to adapt the step size after every inner iteration.
    #[serde(default = "default_true")]
    pub tune_step_size: bool,

    /// Acceptance rate the step-size controller aims for.
    #[serde(default = "default_target_p_accept")]
    pub target_p_accept: f64,

    /// Factor by which the step size grows or shrinks per adaptation.
    #[serde(default = "default_step_size_multiplier")]
    pub step_size_multiplier: f64,
}

/// Hamiltonian Monte Carlo knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmcConfig {
    /// HMC transitions (momentum refresh + trajectory + accept/reject) per call.
    #[serde(default = "default_n_steps")]
    pub n_outer_steps: usize,

    /// Leapfrog steps per trajectory.
    #[serde(default = "default_n_inner_steps")]
    pub n_inner_steps: usize,

    /// Initial leapfrog step size.
    #[serde(default = "default_hmc_step_size")]
    pub init_step_size: f64,

    /// Whether to adapt the step size after every transition.
    #[serde(default = "default_true")]
    pub adapt_step_size: bool,

    /// Acceptance probability the step-size controller aims for.
    #[serde(default = "default_target_p_accept")]
    pub target_p_accept: f64,

    /// Factor by which the step size grows or shrinks per adaptation.
    #[serde(default = "default_step_size_multiplier")]
    pub step_size_multiplier: f64,

    /// Diagonal of the inverse mass matrix. Unit mass when absent.
    #[serde(default)]
    pub inverse_mass_diag: Option<Vec<f64>>,
}

/// Which transition operator to build, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionOperatorConfig {
    Metropolis(MetropolisConfig),
    Hmc(HmcConfig),
}

/// Full sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmcConfig {
    /// Number of intermediate distributions (annealing stages) between `q` and the
    /// alpha-divergence target.
    pub n_intermediate_distributions: usize,

    #[serde(default)]
    pub spacing_type: SpacingType,

    /// Alpha of the alpha-divergence. `2` targets `p^2/q`; `1` gives plain AIS to `p`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Resample when the ESS drops. Without it the sampler is AIS.
    #[serde(default = "default_true")]
    pub use_resampling: bool,

    /// Normalized-ESS fraction in `(0, 1]` below which resampling happens.
    #[serde(default = "default_resampling_threshold")]
    pub resampling_threshold: f64,

    pub transition_operator: TransitionOperatorConfig,
}

fn default_n_steps() -> usize {
    1
}
fn default_n_inner_steps() -> usize {
    5
}
fn default_metropolis_step_size() -> f64 {
    1.0
}
fn default_hmc_step_size() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_target_p_accept() -> f64 {
    0.65
}
fn default_step_size_multiplier() -> f64 {
    1.1
}
fn default_alpha() -> f64 {
    2.0
}
fn default_resampling_threshold() -> f64 {
    0.3
}

impl Default for MetropolisConfig {
    fn default() -> Self {
        Self {
            n_steps: default_n_steps(),
            init_step_size: default_metropolis_step_size(),
            tune_step_size: true,
            target_p_accept: default_target_p_accept(),
            step_size_multiplier: default_step_size_multiplier(),
        }
    }
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            n_outer_steps: default_n_steps(),
            n_inner_steps: default_n_inner_steps(),
            init_step_size: default_hmc_step_size(),
            adapt_step_size: true,
            target_p_accept: default_target_p_accept(),
            step_size_multiplier: default_step_size_multiplier(),
            inverse_mass_diag: None,
        }
    }
}

impl SmcConfig {
    /// A configuration with default knobs around the given operator.
    pub fn new(n_intermediate_distributions: usize, transition_operator: TransitionOperatorConfig) -> Self {
        Self {
            n_intermediate_distributions,
            spacing_type: SpacingType::default(),
            alpha: default_alpha(),
            use_resampling: true,
            resampling_threshold: default_resampling_threshold(),
            transition_operator,
        }
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, SmcError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded SMC config");
        Ok(config)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, SmcError> {
        let config: SmcConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SmcError> {
        validate_sampler(
            self.n_intermediate_distributions,
            self.alpha,
            self.resampling_threshold,
        )?;
        self.transition_operator.validate()
    }
}

/// Checks the sampler-level knobs shared by [`SmcConfig`] and `build_smc`.
pub(crate) fn validate_sampler(
    n_intermediate_distributions: usize,
    alpha: f64,
    resampling_threshold: f64,
) -> Result<(), SmcError> {
    if n_intermediate_distributions == 0 {
        return Err(SmcError::InvalidConfig(
            "n_intermediate_distributions must be at least 1".into(),
        ));
    }
    if !alpha.is_finite() {
        return Err(SmcError::InvalidConfig(format!(
            "alpha must be finite, got {alpha}"
        )));
    }
    if !(resampling_threshold > 0.0 && resampling_threshold <= 1.0) {
        return Err(SmcError::InvalidConfig(format!(
            "resampling_threshold must lie in (0, 1], got {resampling_threshold}"
        )));
    }
    Ok(())
}

fn validate_tuning(step_size: f64, target_p_accept: f64, multiplier: f64) -> Result<(), SmcError> {
    if !(step_size.is_finite() && step_size > 0.0) {
        return Err(SmcError::InvalidConfig(format!(
            "init_step_size must be positive, got {step_size}"
        )));
    }
    if !(target_p_accept > 0.0 && target_p_accept < 1.0) {
        return Err(SmcError::InvalidConfig(format!(
            "target_p_accept must lie in (0, 1), got {target_p_accept}"
        )));
    }
    if !(multiplier.is_finite() && multiplier > 1.0) {
        return Err(SmcError::InvalidConfig(format!(
            "step_size_multiplier must exceed 1, got {multiplier}"
        )));
    }
    Ok(())
}

impl TransitionOperatorConfig {
    pub fn validate(&self) -> Result<(), SmcError> {
        match self {
            TransitionOperatorConfig::Metropolis(c) => {
                if c.n_steps == 0 {
                    return Err(SmcError::InvalidConfig("n_steps must be at least 1".into()));
                }
                validate_tuning(c.init_step_size, c.target_p_accept, c.step_size_multiplier)
            }
            TransitionOperatorConfig::Hmc(c) => {
                if c.n_outer_steps == 0 || c.n_inner_steps == 0 {
                    return Err(SmcError::InvalidConfig(
                        "n_outer_steps and n_inner_steps must be at least 1".into(),
                    ));
                }
                if let Some(inv_mass) = &c.inverse_mass_diag {
                    if inv_mass.iter().any(|&m| !(m.is_finite() && m > 0.0)) {
                        return Err(SmcError::InvalidConfig(
                            "inverse_mass_diag entries must be positive".into(),
                        ));
                    }
                }
                validate_tuning(c.init_step_size, c.target_p_accept, c.step_size_multiplier)
            }
        }
    }
}
