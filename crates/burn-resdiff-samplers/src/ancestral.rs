//! Ancestral sampler
//!
//! Walks every timestep from `T-1` down to `0`, drawing each state from the
//! closed-form posterior around the denoiser's prediction.
//!
//! # Update
//!
//! ```text
//! x_{t-1} = μ(x_t, t) + exp(0.5 · log σ²_t) · ε    (ε = 0 at t = 0)
//! ```

use burn::prelude::*;
use burn_resdiff_core::{Conditioning, Denoiser, DiffusionError, NoiseGenerator};

use crate::posterior::PosteriorEngine;
use crate::sampler::{full_timesteps, Sampler, Trajectory};

/// Full-length stochastic reverse chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AncestralSampler;

impl AncestralSampler {
    pub fn new() -> Self {
        Self
    }

    /// One reverse step at timestep `t`
    ///
    /// # Returns
    ///
    /// `(x_{t-1}, predicted start image)`
    pub fn p_sample<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        x: Tensor<B, 4>,
        t: usize,
        cond: Option<&Conditioning<B>>,
        self_cond: Option<Tensor<B, 4>>,
        rng: &mut NoiseGenerator,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>), DiffusionError> {
        let [batch, _, _, _] = x.dims();
        let timesteps = full_timesteps::<B>(batch, t, &x.device());

        let (posterior, preds) = engine.p_mean_variance(x, timesteps, cond, self_cond)?;

        let img = if t > 0 {
            let noise = rng.normal_like(&posterior.mean);
            posterior.mean + posterior.log_variance.mul_scalar(0.5).exp() * noise
        } else {
            posterior.mean
        };

        Ok((img, preds.pred_x_start))
    }
}

impl Sampler for AncestralSampler {
    fn name(&self) -> &'static str {
        "ancestral"
    }

    fn denoise<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        img: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
        rng: &mut NoiseGenerator,
        record: bool,
    ) -> Result<Trajectory<B>, DiffusionError> {
        let num_timesteps = engine.schedule().num_timesteps();
        let self_condition = engine.mode().self_condition;

        let mut img = img;
        let mut x_start: Option<Tensor<B, 4>> = None;
        let mut states = Vec::new();

        for t in (0..num_timesteps).rev() {
            log::trace!("ancestral step t={t}");
            let self_cond = if self_condition { x_start.take() } else { None };
            let (next, pred_x_start) = self.p_sample(engine, img, t, cond, self_cond, rng)?;

            img = next;
            x_start = Some(pred_x_start.detach());
            if record {
                states.push(img.clone());
            }
        }

        Ok(Trajectory { image: img, states })
    }
}
