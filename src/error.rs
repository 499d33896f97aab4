//! Error type shared by the sampler, its transition operators and the resampler.

/// Errors raised while building or running the SMC sampler.
///
/// Shape and contract violations (an empty batch, a per-stage state vector of the
/// wrong length) are not represented here: they indicate caller misuse and panic.
#[derive(Debug, thiserror::Error)]
pub enum SmcError {
    /// A configuration value is out of its admissible range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The annealing schedule name is neither `linear` nor `geometric`.
    #[error("Unknown spacing type `{0}`, expected `linear` or `geometric`")]
    UnknownSpacingType(String),

    /// Every particle in the batch has a non-finite position or log density,
    /// so there is no donor to copy from.
    #[error("No valid samples in batch: every particle has a non-finite position or log density")]
    NoValidSamples,

    /// Resampling weights are all zero or non-finite.
    #[error("Cannot resample: importance weights are all zero or non-finite")]
    DegenerateWeights,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}
