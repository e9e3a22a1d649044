//! burn-resdiff: Residual Diffusion on Burn
//!
//! Diffusion models whose forward process shifts a clean image towards a
//! degraded input (or a blank image) while adding Gaussian noise. A denoiser
//! predicts both the residual and the noise; sampling walks the process
//! back with an ancestral or a strided (DDIM-style) sampler.
//!
//! # Modes
//!
//! - Generation: start from pure noise, produce `[batch, C, size, size]` images
//! - Restoration: condition on a degraded input (and optionally a mask)
//!
//! # Backend Selection
//!
//! Choose a backend via feature flags (see [`backends`]):
//! `ndarray`, `tch`, `wgpu`, `cuda`.
//!
//! # Example
//!
//! ```ignore
//! use burn_resdiff::{NoiseGenerator, ResidualDiffusionConfig, TrainingBatch};
//! use burn_resdiff::unet::{UnetConfig, UnetRes};
//!
//! let unet = UnetRes::new(&UnetConfig::new(64).with_condition(true), &device)?;
//! let model = ResidualDiffusionConfig::new(256)
//!     .with_condition(true)
//!     .with_sampling_timesteps(10)
//!     .init(unet, &device)?;
//!
//! let mut rng = NoiseGenerator::seeded(0);
//! let loss = model.forward(TrainingBatch::conditional(clean, Conditioning::new(degraded)), &mut rng)?;
//! let restored = model.sample(Some(Conditioning::new(degraded)), 1, false, &mut rng)?.image;
//! ```

pub mod backends;
pub mod config;
pub mod loss;
pub mod model;

pub use burn_resdiff_core as core;
pub use burn_resdiff_samplers as samplers;
pub use burn_resdiff_unet as unet;

pub use burn_resdiff_core::{
    normalize_to_neg_one_to_one, unnormalize_to_zero_to_one, Conditioning, Denoiser, DenoiserOutput,
    DiffusionError, Mode, NoiseGenerator,
};
pub use burn_resdiff_samplers::{
    AncestralSampler, ResidualSchedule, ReverseSampler, SampleOutput, Sampler, StridedSampler,
};

pub use config::ResidualDiffusionConfig;
pub use loss::{LossTarget, LossType, TrainingBatch};
pub use model::ResidualDiffusion;
