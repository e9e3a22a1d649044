//! Operating mode of a residual diffusion model
//!
//! The source of truth for which channels the denoiser sees. All downstream
//! code branches on a validated [`Mode`] instead of re-checking loose flags.

use burn::prelude::*;

use crate::error::DiffusionError;

/// Mode flags, validated once at model construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    /// Image-to-image: the degraded input is stacked after the sample channels
    pub condition: bool,
    /// An extra fixed mask image is stacked after the degraded input
    pub input_condition: bool,
    /// The mask is already in its final range and must not be normalized
    pub input_condition_mask: bool,
    /// The denoiser accepts a predicted start image as auxiliary input
    pub self_condition: bool,
    /// Clamp predicted residual and start image to `[-1, 1]`
    pub clip_denoised: bool,
}

impl Default for Mode {
    fn default() -> Self {
        Self::generation()
    }
}

impl Mode {
    /// Unconditional generation from pure noise
    pub fn generation() -> Self {
        Self {
            condition: false,
            input_condition: false,
            input_condition_mask: false,
            self_condition: false,
            clip_denoised: true,
        }
    }

    /// Image-to-image restoration conditioned on a degraded input
    pub fn conditional() -> Self {
        Self {
            condition: true,
            ..Self::generation()
        }
    }

    pub fn with_input_condition(mut self, input_condition: bool) -> Self {
        self.input_condition = input_condition;
        self
    }

    pub fn with_input_condition_mask(mut self, input_condition_mask: bool) -> Self {
        self.input_condition_mask = input_condition_mask;
        self
    }

    pub fn with_self_condition(mut self, self_condition: bool) -> Self {
        self.self_condition = self_condition;
        self
    }

    pub fn with_clip_denoised(mut self, clip_denoised: bool) -> Self {
        self.clip_denoised = clip_denoised;
        self
    }

    /// Rejects flag combinations that have no meaning
    pub fn validate(&self) -> Result<(), DiffusionError> {
        if (self.input_condition || self.input_condition_mask) && !self.condition {
            return Err(DiffusionError::MaskWithoutCondition);
        }
        Ok(())
    }

    /// Number of channels the denoiser's first layer receives for
    /// `channels`-channel images, self-conditioning included
    pub fn denoiser_in_channels(&self, channels: usize) -> usize {
        let stacked = 1
            + usize::from(self.self_condition)
            + usize::from(self.condition)
            + usize::from(self.input_condition);
        channels * stacked
    }

    /// Stacks the conditioning channels after the sample: `[x, input, mask]`
    pub fn denoiser_input<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
    ) -> Result<Tensor<B, 4>, DiffusionError> {
        if !self.condition {
            return match cond {
                Some(_) => Err(DiffusionError::UnexpectedCondition),
                None => Ok(x),
            };
        }

        let cond = cond.ok_or(DiffusionError::MissingCondition(""))?;
        if self.input_condition {
            let mask = cond
                .mask
                .clone()
                .ok_or(DiffusionError::MissingCondition(" and a mask"))?;
            Ok(Tensor::cat(vec![x, cond.input.clone(), mask], 1))
        } else {
            Ok(Tensor::cat(vec![x, cond.input.clone()], 1))
        }
    }

    /// The image the forward process shifts away from: the degraded input
    /// in conditional mode, a zero image otherwise
    pub fn reference_image<B: Backend>(
        &self,
        cond: Option<&Conditioning<B>>,
        like: &Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match cond {
            Some(cond) if self.condition => cond.input.clone(),
            _ => Tensor::zeros(like.dims(), &like.device()),
        }
    }
}

/// Conditioning images for image-to-image mode, already in `[-1, 1]`
/// (the mask keeps whatever range it was given in).
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Degraded observation `[batch, channels, height, width]`
    pub input: Tensor<B, 4>,
    /// Optional fixed mask with the same shape as `input`
    pub mask: Option<Tensor<B, 4>>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(input: Tensor<B, 4>) -> Self {
        Self { input, mask: None }
    }

    pub fn with_mask(mut self, mask: Tensor<B, 4>) -> Self {
        self.mask = Some(mask);
        self
    }
}
