//! Error type shared by every residual diffusion crate

use thiserror::Error;

/// Configuration and usage errors.
///
/// Invariant violations inside the engine (a coefficient sequence that does
/// not sum to one) are bugs and panic instead of surfacing here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffusionError {
    #[error("invalid loss type {0:?}, expected \"l1\" or \"l2\"")]
    InvalidLossType(String),

    #[error("num_timesteps must be at least 1, got {0}")]
    InvalidTimesteps(usize),

    #[error("sampling_timesteps ({sampling}) must be in 1..={total}")]
    SamplingTimesteps { sampling: usize, total: usize },

    #[error("ddim_sampling_eta must be in [0, 1], got {0}")]
    InvalidEta(f64),

    #[error("sum_scale must be positive and finite, got {0}")]
    InvalidSumScale(f64),

    #[error("denoiser output channels ({out_channels}) differ from image channels ({channels})")]
    ChannelMismatch { channels: usize, out_channels: usize },

    #[error("conditional mode requires an input image{0}")]
    MissingCondition(&'static str),

    #[error("conditioning input given to an unconditional model")]
    UnexpectedCondition,

    #[error("input_condition requires condition to be enabled")]
    MaskWithoutCondition,

    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),
}
