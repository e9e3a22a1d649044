//! U-Net Denoisers for Residual Diffusion
//!
//! Reference backbone for the residual diffusion engine.
//!
//! # Models
//!
//! - [`UnetRes`] - Dual-tower network predicting residual and noise; implements
//!   [`burn_resdiff_core::Denoiser`]
//! - [`Unet`] - Single tower, the building block of [`UnetRes`]
//!
//! # Building Blocks
//!
//! - [`ResnetBlock`] - Weight-standardized conv blocks with time scale/shift
//! - [`LinearAttentionBlock`], [`AttentionBlock`] - Pre-norm residual attention
//! - [`Downsample`], [`Upsample`] - Resolution scaling
//!
//! # Example
//!
//! ```ignore
//! use burn_resdiff_unet::{UnetConfig, UnetRes};
//!
//! let config = UnetConfig::new(64).with_condition(true);
//! let model = UnetRes::<Backend>::new(&config, &device)?;
//! let (res, noise) = model.forward(x, t, None);
//! ```

pub mod blocks;
pub mod unet;
pub mod unet_res;

pub use blocks::{
    sinusoidal_embedding, Attention, AttentionBlock, Block, Downsample, LinearAttention,
    LinearAttentionBlock, ResnetBlock, Upsample, WeightStandardizedConv2d,
};
pub use unet::{DownLevel, Unet, UnetConfig, UpLevel};
pub use unet_res::UnetRes;
