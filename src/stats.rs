//! Diagnostics produced by the transition operators and the SMC sampler.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Diagnostics of one call to a transition operator's `step`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionInfo {
    /// Average over the batch (and inner iterations) of `min(1, exp(log accept ratio))`,
    /// with non-finite ratios counted as zero.
    pub mean_acceptance_rate: f64,
    /// Step size after tuning.
    pub step_size: f64,
    /// Operator-specific metrics.
    pub extra: BTreeMap<String, f64>,
}

/// Diagnostics of one annealing stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageInfo {
    /// Temperature the transition targeted.
    pub beta: f64,
    /// ESS before the resampling decision, `None` when resampling is disabled.
    pub ess: Option<f64>,
    /// ESS after the resampling decision, `None` when resampling is disabled.
    pub ess_after_resampling: Option<f64>,
    pub resampled: bool,
    /// Particles reverted to their pre-transition state because the transition made
    /// them non-finite.
    pub n_reverted: usize,
    pub transition: TransitionInfo,
}

/// Aggregated diagnostics of one SMC forward pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmcInfo {
    pub stages: Vec<StageInfo>,
    /// Log ESS of the plain importance weights `log_p - log_q` of the initial points.
    pub log_ess_q_p: f64,
    pub ess_q_p: f64,
    /// Log ESS of the final SMC weights.
    pub log_ess_smc_final: f64,
    pub ess_smc_final: f64,
    /// Particles whose final position and log weight are both finite.
    pub n_finite_samples: usize,
    /// Largest absolute coordinate among the final positions.
    pub max_abs_x: f64,
}

impl SmcInfo {
    /// Flattens the diagnostics into `name -> value` pairs, numbering stages from 1
    /// (`dist1_mean_acceptance_rate`, `dist1_step_size`, ...).
    pub fn to_flat_map(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            let prefix = format!("dist{}_", i + 1);
            out.insert(format!("{prefix}beta"), stage.beta);
            if let Some(ess) = stage.ess {
                out.insert(format!("{prefix}ess"), ess);
            }
            if let Some(ess) = stage.ess_after_resampling {
                out.insert(format!("{prefix}ess_after_resampling"), ess);
            }
            out.insert(
                format!("{prefix}resampled"),
                if stage.resampled { 1.0 } else { 0.0 },
            );
            out.insert(format!("{prefix}n_reverted"), stage.n_reverted as f64);
            out.insert(
                format!("{prefix}mean_acceptance_rate"),
                stage.transition.mean_acceptance_rate,
            );
            out.insert(format!("{prefix}step_size"), stage.transition.step_size);
            for (key, value) in &stage.transition.extra {
                out.insert(format!("{prefix}{key}"), *value);
            }
        }
        out.insert("log_ess_q_p".to_string(), self.log_ess_q_p);
        out.insert("ess_q_p".to_string(), self.ess_q_p);
        out.insert("log_ess_smc_final".to_string(), self.log_ess_smc_final);
        out.insert("ess_smc_final".to_string(), self.ess_smc_final);
        out.insert("n_finite_samples".to_string(), self.n_finite_samples as f64);
        out.insert("max_abs_x".to_string(), self.max_abs_x);
        out
    }

    /// Mean acceptance rate over all stages.
    pub fn mean_acceptance_rate(&self) -> f64 {
        if self.stages.is_empty() {
            return f64::NAN;
        }
        self.stages
            .iter()
            .map(|s| s.transition.mean_acceptance_rate)
            .sum::<f64>()
            / self.stages.len() as f64
    }

    /// Number of stages that resampled before their transition.
    pub fn n_resampled(&self) -> usize {
        self.stages.iter().filter(|s| s.resampled).count()
    }
}

impl fmt::Display for SmcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stages={} p(accept)≈{:.2} resampled={} ess(q,p)={:.1} ess(smc)={:.1} finite={} max|x|={:.2}",
            self.stages.len(),
            self.mean_acceptance_rate(),
            self.n_resampled(),
            self.ess_q_p,
            self.ess_smc_final,
            self.n_finite_samples,
            self.max_abs_x
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(accept: f64, step_size: f64, resampled: bool) -> StageInfo {
        StageInfo {
            beta: 0.5,
            ess: Some(10.0),
            ess_after_resampling: Some(if resampled { 20.0 } else { 10.0 }),
            resampled,
            n_reverted: 0,
            transition: TransitionInfo {
                mean_acceptance_rate: accept,
                step_size,
                extra: BTreeMap::from([("n_steps".to_string(), 3.0)]),
            },
        }
    }

    fn info() -> SmcInfo {
        SmcInfo {
            stages: vec![stage(0.5, 0.1, false), stage(0.7, 0.2, true)],
            log_ess_q_p: 1.0,
            ess_q_p: 1.0_f64.exp(),
            log_ess_smc_final: 2.0,
            ess_smc_final: 2.0_f64.exp(),
            n_finite_samples: 20,
            max_abs_x: 3.5,
        }
    }

    #[test]
    fn test_flat_map_keys() {
        let flat = info().to_flat_map();
        assert_eq!(flat["dist1_mean_acceptance_rate"], 0.5);
        assert_eq!(flat["dist2_step_size"], 0.2);
        assert_eq!(flat["dist2_resampled"], 1.0);
        assert_eq!(flat["dist1_n_steps"], 3.0);
        assert_eq!(flat["n_finite_samples"], 20.0);
        assert!(!flat.contains_key("dist3_step_size"));
    }

    #[test]
    fn test_summary() {
        let info = info();
        assert!((info.mean_acceptance_rate() - 0.6).abs() < 1e-12);
        assert_eq!(info.n_resampled(), 1);
        let shown = format!("{info}");
        assert!(shown.contains("resampled=1"), "{shown}");
    }
}
