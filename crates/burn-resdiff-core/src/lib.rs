//! Core Building Blocks for Residual Diffusion
//!
//! Shared pieces used by the schedule/sampler crate, the reference backbone
//! and the `burn-resdiff` facade.
//!
//! # Modules
//!
//! - [`error`] - [`DiffusionError`], the single error type of the workspace
//! - [`mode`] - [`Mode`] flags validated once, and [`Conditioning`] inputs
//! - [`denoiser`] - The [`Denoiser`] call contract consumed by the engine
//! - [`noise`] - Seeded Gaussian noise and timestep draws
//! - [`pixel`] - Conversions between `[0, 1]` and `[-1, 1]` pixel ranges
//!
//! ## Normalization Layers
//!
//! - [`groupnorm`] - Group normalization (used in ResNet blocks)
//! - [`layernorm`] - Channel-wise layer normalization (used before attention)

pub mod denoiser;
pub mod error;
pub mod groupnorm;
pub mod layernorm;
pub mod mode;
pub mod noise;
pub mod pixel;

pub use denoiser::{Denoiser, DenoiserOutput};
pub use error::DiffusionError;
pub use mode::{Conditioning, Mode};
pub use noise::NoiseGenerator;
pub use pixel::{normalize_to_neg_one_to_one, unnormalize_to_zero_to_one};
