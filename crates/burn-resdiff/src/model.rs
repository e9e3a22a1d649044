//! Residual diffusion model
//!
//! Owns a denoiser together with the schedule, mode and sampler it was
//! validated against. Training goes through [`ResidualDiffusion::forward`]
//! (see [`crate::loss`]), inference through [`ResidualDiffusion::sample`].

use burn::prelude::*;
use burn_resdiff_core::{
    normalize_to_neg_one_to_one, Conditioning, Denoiser, DiffusionError, Mode, NoiseGenerator,
};
use burn_resdiff_samplers::{PosteriorEngine, ResidualSchedule, ReverseSampler, SampleOutput, Sampler};

use crate::loss::{LossTarget, LossType};

/// A denoiser wrapped with its residual diffusion process
///
/// Built by [`crate::ResidualDiffusionConfig::init`].
#[derive(Debug)]
pub struct ResidualDiffusion<B: Backend, M> {
    denoiser: M,
    schedule: ResidualSchedule<B>,
    mode: Mode,
    sampler: ReverseSampler,
    loss_type: LossType,
    loss_target: LossTarget,
    image_size: usize,
}

impl<B: Backend, M: Denoiser<B>> ResidualDiffusion<B, M> {
    pub(crate) fn from_parts(
        denoiser: M,
        schedule: ResidualSchedule<B>,
        mode: Mode,
        sampler: ReverseSampler,
        loss_type: LossType,
        loss_target: LossTarget,
        image_size: usize,
    ) -> Self {
        Self {
            denoiser,
            schedule,
            mode,
            sampler,
            loss_type,
            loss_target,
            image_size,
        }
    }

    pub fn denoiser(&self) -> &M {
        &self.denoiser
    }

    pub fn into_denoiser(self) -> M {
        self.denoiser
    }

    /// Replaces the denoiser, e.g. with the result of an optimizer step
    pub fn map_denoiser(self, f: impl FnOnce(M) -> M) -> Self {
        Self {
            denoiser: f(self.denoiser),
            ..self
        }
    }

    pub fn schedule(&self) -> &ResidualSchedule<B> {
        &self.schedule
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn sampler(&self) -> ReverseSampler {
        self.sampler
    }

    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    pub fn loss_target(&self) -> LossTarget {
        self.loss_target
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn sum_scale(&self) -> f64 {
        self.schedule.sum_scale()
    }

    /// Posterior math bound to this model's denoiser
    pub fn engine(&self) -> PosteriorEngine<'_, B, M> {
        PosteriorEngine::new(&self.schedule, &self.denoiser, self.mode)
    }

    /// Maps conditioning images from `[0, 1]` to `[-1, 1]`
    ///
    /// The mask keeps its range when the model treats it as a raw mask.
    pub fn normalize_condition(&self, cond: Conditioning<B>) -> Conditioning<B> {
        let keep_mask = self.mode.input_condition && self.mode.input_condition_mask;
        Conditioning {
            input: normalize_to_neg_one_to_one(cond.input),
            mask: cond.mask.map(|mask| {
                if keep_mask {
                    mask
                } else {
                    normalize_to_neg_one_to_one(mask)
                }
            }),
        }
    }

    /// Generates images with the configured sampler
    ///
    /// # Arguments
    ///
    /// * `cond` - Degraded input (and mask) in `[0, 1]`; required in
    ///   conditional mode, where it also fixes the output shape
    /// * `batch_size` - Number of images for unconditional generation
    /// * `return_all_steps` - Keep every intermediate state
    /// * `rng` - Noise source
    pub fn sample(
        &self,
        cond: Option<Conditioning<B>>,
        batch_size: usize,
        return_all_steps: bool,
        rng: &mut NoiseGenerator,
    ) -> Result<SampleOutput<B>, DiffusionError> {
        self.sample_with(&self.sampler, cond, batch_size, return_all_steps, rng)
    }

    /// [`ResidualDiffusion::sample`] with an explicit sampler
    pub fn sample_with<S: Sampler>(
        &self,
        sampler: &S,
        cond: Option<Conditioning<B>>,
        batch_size: usize,
        return_all_steps: bool,
        rng: &mut NoiseGenerator,
    ) -> Result<SampleOutput<B>, DiffusionError> {
        let cond = cond.map(|cond| self.normalize_condition(cond));
        let shape = [
            batch_size,
            self.denoiser.channels(),
            self.image_size,
            self.image_size,
        ];
        sampler.sample(&self.engine(), shape, cond.as_ref(), rng, return_all_steps)
    }
}
