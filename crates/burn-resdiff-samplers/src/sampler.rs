//! Shared sampling driver
//!
//! Every reverse sampler starts from the same initial state and reports its
//! result in the same [`SampleOutput`]; only the walk over timesteps differs.

use burn::prelude::*;
use burn_resdiff_core::{
    unnormalize_to_zero_to_one, Conditioning, Denoiser, DiffusionError, NoiseGenerator,
};

use crate::posterior::PosteriorEngine;

/// States of one reverse chain, in `[-1, 1]`
#[derive(Debug, Clone)]
pub struct Trajectory<B: Backend> {
    /// Final sample
    pub image: Tensor<B, 4>,
    /// Every state after each step, final one included. Empty unless recorded.
    pub states: Vec<Tensor<B, 4>>,
}

/// Result of a sampling call, mapped back to `[0, 1]`
#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend> {
    /// Noised conditioning input the chain started from (conditional mode only)
    pub input_add_noise: Option<Tensor<B, 4>>,
    /// Intermediate states, final one included, when all steps were requested
    pub steps: Vec<Tensor<B, 4>>,
    /// Final sample
    pub image: Tensor<B, 4>,
}

impl<B: Backend> SampleOutput<B> {
    /// Flattens into the ordered image list returned by sampling:
    /// the noised input first (if any), then either every step or the
    /// final image alone
    pub fn into_frames(self) -> Vec<Tensor<B, 4>> {
        let mut frames: Vec<_> = self.input_add_noise.into_iter().collect();
        if self.steps.is_empty() {
            frames.push(self.image);
        } else {
            frames.extend(self.steps);
        }
        frames
    }
}

/// A strategy for walking the reverse chain
pub trait Sampler {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Runs the reverse chain from `img`
    ///
    /// # Arguments
    ///
    /// * `engine` - Schedule, denoiser and mode
    /// * `img` - Initial state in `[-1, 1]`
    /// * `cond` - Conditioning images (conditional mode)
    /// * `rng` - Noise source for stochastic steps
    /// * `record` - Keep every intermediate state
    fn denoise<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        img: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
        rng: &mut NoiseGenerator,
        record: bool,
    ) -> Result<Trajectory<B>, DiffusionError>;

    /// Draws the initial state, runs [`Sampler::denoise`] and maps the
    /// result to `[0, 1]`
    ///
    /// `shape` is used for unconditional generation; conditional sampling
    /// takes its shape from the conditioning input.
    fn sample<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        shape: [usize; 4],
        cond: Option<&Conditioning<B>>,
        rng: &mut NoiseGenerator,
        return_all_steps: bool,
    ) -> Result<SampleOutput<B>, DiffusionError> {
        let (img, input_add_noise) = initial_state(engine, shape, cond, rng)?;

        log::debug!(
            "{} sampling: shape {:?}, conditional={}",
            self.name(),
            img.dims(),
            input_add_noise.is_some()
        );

        let trajectory = self.denoise(engine, img, cond, rng, return_all_steps)?;

        Ok(SampleOutput {
            input_add_noise: input_add_noise.map(unnormalize_to_zero_to_one),
            steps: trajectory
                .states
                .into_iter()
                .map(unnormalize_to_zero_to_one)
                .collect(),
            image: unnormalize_to_zero_to_one(trajectory.image),
        })
    }
}

/// Initial reverse-chain state, plus the same tensor again in conditional mode
///
/// Conditional: `x_input + sqrt(sum_scale) · ε`. Otherwise pure `ε`.
pub fn initial_state<B: Backend, M: Denoiser<B>>(
    engine: &PosteriorEngine<'_, B, M>,
    shape: [usize; 4],
    cond: Option<&Conditioning<B>>,
    rng: &mut NoiseGenerator,
) -> Result<(Tensor<B, 4>, Option<Tensor<B, 4>>), DiffusionError> {
    let schedule = engine.schedule();

    if engine.mode().condition {
        let cond = cond.ok_or(DiffusionError::MissingCondition(""))?;
        let noise = rng.normal_like(&cond.input);
        let img = cond.input.clone() + noise.mul_scalar(schedule.sum_scale().sqrt());
        Ok((img.clone(), Some(img)))
    } else {
        if cond.is_some() {
            return Err(DiffusionError::UnexpectedCondition);
        }
        Ok((rng.normal(shape, schedule.device()), None))
    }
}

/// Per-sample timestep tensor filled with `t`
pub(crate) fn full_timesteps<B: Backend>(batch: usize, t: usize, device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::full([batch], t as i64, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_into_frames_ordering() {
        let device = Default::default();
        let frame = |v: f32| Tensor::<TestBackend, 4>::full([1, 1, 1, 1], v, &device);
        let first = |frames: &[Tensor<TestBackend, 4>]| -> Vec<f32> {
            frames
                .iter()
                .map(|f| f.clone().into_data().to_vec::<f32>().unwrap()[0])
                .collect()
        };

        let last_only = SampleOutput {
            input_add_noise: Some(frame(0.0)),
            steps: Vec::new(),
            image: frame(1.0),
        };
        assert_eq!(first(&last_only.into_frames()), vec![0.0, 1.0]);

        let all = SampleOutput {
            input_add_noise: None,
            steps: vec![frame(0.2), frame(0.4), frame(0.6)],
            image: frame(0.6),
        };
        assert_eq!(first(&all.into_frames()), vec![0.2, 0.4, 0.6]);
    }
}
