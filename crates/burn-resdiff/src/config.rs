//! Residual diffusion model configuration

use burn::prelude::*;
use burn_resdiff_core::{Denoiser, DiffusionError, Mode};
use burn_resdiff_samplers::{ResidualSchedule, ReverseSampler, Sampler};

use crate::loss::{LossTarget, LossType};
use crate::model::ResidualDiffusion;

/// Default noise budget for image-to-image restoration
pub const CONDITIONAL_SUM_SCALE: f64 = 0.01;

/// Default noise budget for unconditional generation
pub const GENERATION_SUM_SCALE: f64 = 1.0;

/// Construction parameters of a [`ResidualDiffusion`] model
#[derive(Debug, Clone)]
pub struct ResidualDiffusionConfig {
    /// Side length of generated images (unconditional sampling)
    pub image_size: usize,
    /// Forward-process horizon `T`
    pub num_timesteps: usize,
    /// Reverse steps; `None` means `num_timesteps` (ancestral sampling)
    pub sampling_timesteps: Option<usize>,
    /// `"l1"` or `"l2"`
    pub loss_type: String,
    /// What the predictions are compared against
    pub loss_target: LossTarget,
    /// Strided-sampler stochasticity in `[0, 1]`; ignored in conditional mode
    pub ddim_sampling_eta: f64,
    /// Image-to-image restoration from a degraded input
    pub condition: bool,
    /// Stack an extra mask after the degraded input
    pub input_condition: bool,
    /// The mask is used as given instead of being normalized
    pub input_condition_mask: bool,
    /// Total noise variance; defaults to 0.01 conditional, 1.0 otherwise
    pub sum_scale: Option<f64>,
    /// Clamp predicted residual and start image to `[-1, 1]` while sampling
    pub clip_denoised: bool,
}

impl Default for ResidualDiffusionConfig {
    fn default() -> Self {
        Self {
            image_size: 64,
            num_timesteps: 1000,
            sampling_timesteps: None,
            loss_type: "l1".to_string(),
            loss_target: LossTarget::ResidualNoise,
            ddim_sampling_eta: 0.0,
            condition: false,
            input_condition: false,
            input_condition_mask: false,
            sum_scale: None,
            clip_denoised: true,
        }
    }
}

impl ResidualDiffusionConfig {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            ..Self::default()
        }
    }

    pub fn with_num_timesteps(mut self, num_timesteps: usize) -> Self {
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_sampling_timesteps(mut self, sampling_timesteps: usize) -> Self {
        self.sampling_timesteps = Some(sampling_timesteps);
        self
    }

    pub fn with_loss_type(mut self, loss_type: impl Into<String>) -> Self {
        self.loss_type = loss_type.into();
        self
    }

    pub fn with_loss_target(mut self, loss_target: LossTarget) -> Self {
        self.loss_target = loss_target;
        self
    }

    pub fn with_ddim_sampling_eta(mut self, eta: f64) -> Self {
        self.ddim_sampling_eta = eta;
        self
    }

    pub fn with_condition(mut self, condition: bool) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_input_condition(mut self, input_condition: bool) -> Self {
        self.input_condition = input_condition;
        self
    }

    pub fn with_input_condition_mask(mut self, input_condition_mask: bool) -> Self {
        self.input_condition_mask = input_condition_mask;
        self
    }

    pub fn with_sum_scale(mut self, sum_scale: f64) -> Self {
        self.sum_scale = Some(sum_scale);
        self
    }

    pub fn with_clip_denoised(mut self, clip_denoised: bool) -> Self {
        self.clip_denoised = clip_denoised;
        self
    }

    /// Noise budget after applying the mode-dependent default
    pub fn resolved_sum_scale(&self) -> f64 {
        self.sum_scale.unwrap_or(if self.condition {
            CONDITIONAL_SUM_SCALE
        } else {
            GENERATION_SUM_SCALE
        })
    }

    /// Validates the configuration against `denoiser` and builds the model
    ///
    /// # Errors
    ///
    /// Any [`DiffusionError`] configuration variant: unknown loss type,
    /// invalid timesteps, eta or sum scale, mismatched denoiser channels,
    /// or a mask requested without conditioning.
    pub fn init<B: Backend, M: Denoiser<B>>(
        &self,
        denoiser: M,
        device: &B::Device,
    ) -> Result<ResidualDiffusion<B, M>, DiffusionError> {
        let loss_type: LossType = self.loss_type.parse()?;

        if denoiser.channels() != denoiser.out_channels() {
            return Err(DiffusionError::ChannelMismatch {
                channels: denoiser.channels(),
                out_channels: denoiser.out_channels(),
            });
        }

        let mode = Mode {
            condition: self.condition,
            input_condition: self.input_condition,
            input_condition_mask: self.input_condition_mask,
            self_condition: denoiser.self_condition(),
            clip_denoised: self.clip_denoised,
        };
        mode.validate()?;

        if !(0.0..=1.0).contains(&self.ddim_sampling_eta) {
            return Err(DiffusionError::InvalidEta(self.ddim_sampling_eta));
        }
        let eta = if self.condition { 0.0 } else { self.ddim_sampling_eta };

        let sampling_timesteps = self.sampling_timesteps.unwrap_or(self.num_timesteps);
        let schedule = ResidualSchedule::new(self.num_timesteps, self.resolved_sum_scale(), device)?;
        let sampler = ReverseSampler::select(self.num_timesteps, sampling_timesteps, eta)?;

        log::debug!(
            "residual diffusion: {:?}, loss {loss_type}, {} sampler over {sampling_timesteps}/{} steps",
            mode,
            sampler.name(),
            self.num_timesteps
        );

        Ok(ResidualDiffusion::from_parts(
            denoiser,
            schedule,
            mode,
            sampler,
            loss_type,
            self.loss_target,
            self.image_size,
        ))
    }
}
