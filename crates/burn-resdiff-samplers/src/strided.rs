//! Strided (DDIM-style) sampler
//!
//! Visits `S <= T` timesteps taken from an even grid over `[-1, T-1]` and
//! jumps between them with a generalized posterior step. `eta` interpolates
//! between a deterministic walk (`eta = 0`) and the ancestral variance
//! (`eta = 1`).
//!
//! # Update
//!
//! For a pair `(t, n)` with `n >= 0`:
//!
//! ```text
//! α  = ᾱ_t − ᾱ_n
//! β² = β̄²_t − β̄²_n
//! σ² = eta · β² · β̄²_n / β̄²_t
//! x_n = x_t − α · res − (β̄_t − sqrt(β̄²_n − σ²)) · noise + σ · ε
//! ```
//!
//! The final pair `(t, -1)` returns the predicted start image.

use burn::prelude::*;
use burn_resdiff_core::{Conditioning, Denoiser, DiffusionError, NoiseGenerator};

use crate::ancestral::AncestralSampler;
use crate::posterior::PosteriorEngine;
use crate::sampler::{full_timesteps, Sampler, Trajectory};

/// Consecutive `(time, time_next)` pairs visited by the strided sampler
///
/// The grid is `linspace(-1, T-1, S+1)` truncated toward zero and reversed,
/// so `S == T` gives `(T-1, T-2), …, (0, -1)`.
pub fn strided_timesteps(num_timesteps: usize, sampling_timesteps: usize) -> Vec<(i64, i64)> {
    let total = num_timesteps as f64;
    let steps = sampling_timesteps.max(1);

    let times: Vec<i64> = (0..=steps)
        .rev()
        .map(|i| (-1.0 + (i as f64 * total) / steps as f64).trunc() as i64)
        .collect();

    times.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Reduced-step reverse chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StridedSampler {
    /// Number of denoiser evaluations
    pub sampling_timesteps: usize,
    /// Stochasticity in `[0, 1]`
    pub eta: f64,
}

impl StridedSampler {
    /// Creates a strided sampler
    ///
    /// # Arguments
    ///
    /// * `num_timesteps` - Schedule horizon `T`
    /// * `sampling_timesteps` - Steps to take, in `1..=T`
    /// * `eta` - Stochasticity in `[0, 1]`
    pub fn new(num_timesteps: usize, sampling_timesteps: usize, eta: f64) -> Result<Self, DiffusionError> {
        if sampling_timesteps == 0 || sampling_timesteps > num_timesteps {
            return Err(DiffusionError::SamplingTimesteps {
                sampling: sampling_timesteps,
                total: num_timesteps,
            });
        }
        if !(0.0..=1.0).contains(&eta) {
            return Err(DiffusionError::InvalidEta(eta));
        }
        Ok(Self {
            sampling_timesteps,
            eta,
        })
    }
}

impl Sampler for StridedSampler {
    fn name(&self) -> &'static str {
        "strided"
    }

    fn denoise<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        img: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
        rng: &mut NoiseGenerator,
        record: bool,
    ) -> Result<Trajectory<B>, DiffusionError> {
        let schedule = engine.schedule();
        let coefficients = schedule.coefficients();
        let self_condition = engine.mode().self_condition;
        let [batch, _, _, _] = img.dims();
        let device = img.device();

        let mut img = img;
        let mut x_start: Option<Tensor<B, 4>> = None;
        let mut states = Vec::new();

        for (time, time_next) in strided_timesteps(schedule.num_timesteps(), self.sampling_timesteps) {
            log::trace!("strided step {time} -> {time_next}");

            let t = full_timesteps::<B>(batch, time as usize, &device);
            let self_cond = if self_condition { x_start.take() } else { None };
            let preds = engine.model_predictions(img.clone(), t, cond, self_cond)?;
            x_start = Some(preds.pred_x_start.clone().detach());

            if time_next < 0 {
                img = preds.pred_x_start;
            } else {
                let (time, next) = (time as usize, time_next as usize);

                let alpha = coefficients.alphas_cumsum[time] - coefficients.alphas_cumsum[next];
                let betas2_cumsum = coefficients.betas2_cumsum[time];
                let betas2_cumsum_next = coefficients.betas2_cumsum[next];
                let betas2 = betas2_cumsum - betas2_cumsum_next;
                let sigma2 = self.eta * betas2 * betas2_cumsum_next / betas2_cumsum;
                let noise_coef =
                    coefficients.betas_cumsum[time] - (betas2_cumsum_next - sigma2).max(0.0).sqrt();

                img = img - preds.pred_res.mul_scalar(alpha) - preds.pred_noise.mul_scalar(noise_coef);
                if self.eta > 0.0 {
                    let noise = rng.normal_like(&img);
                    img = img + noise.mul_scalar(sigma2.sqrt());
                }
            }

            if record {
                states.push(img.clone());
            }
        }

        Ok(Trajectory { image: img, states })
    }
}

/// Sampler chosen from the model configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReverseSampler {
    Ancestral(AncestralSampler),
    Strided(StridedSampler),
}

impl ReverseSampler {
    /// Ancestral when `sampling_timesteps == num_timesteps`, strided otherwise
    pub fn select(num_timesteps: usize, sampling_timesteps: usize, eta: f64) -> Result<Self, DiffusionError> {
        let strided = StridedSampler::new(num_timesteps, sampling_timesteps, eta)?;
        if sampling_timesteps == num_timesteps {
            Ok(Self::Ancestral(AncestralSampler))
        } else {
            Ok(Self::Strided(strided))
        }
    }
}

impl Sampler for ReverseSampler {
    fn name(&self) -> &'static str {
        match self {
            Self::Ancestral(s) => s.name(),
            Self::Strided(s) => s.name(),
        }
    }

    fn denoise<B: Backend, M: Denoiser<B>>(
        &self,
        engine: &PosteriorEngine<'_, B, M>,
        img: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
        rng: &mut NoiseGenerator,
        record: bool,
    ) -> Result<Trajectory<B>, DiffusionError> {
        match self {
            Self::Ancestral(s) => s.denoise(engine, img, cond, rng, record),
            Self::Strided(s) => s.denoise(engine, img, cond, rng, record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ResidualSchedule;
    use burn_ndarray::NdArray;
    use burn_resdiff_core::{DenoiserOutput, Mode};

    type TestBackend = NdArray<f32>;

    /// Residual and noise proportional to the sample
    struct ScaledDenoiser;

    impl Denoiser<TestBackend> for ScaledDenoiser {
        fn channels(&self) -> usize {
            1
        }

        fn out_channels(&self) -> usize {
            1
        }

        fn self_condition(&self) -> bool {
            false
        }

        fn predict(
            &self,
            x: Tensor<TestBackend, 4>,
            _t: Tensor<TestBackend, 1, Int>,
            _self_cond: Option<Tensor<TestBackend, 4>>,
        ) -> DenoiserOutput<TestBackend> {
            (x.clone().mul_scalar(0.1), x.mul_scalar(0.5))
        }
    }

    #[test]
    fn test_full_grid_pairs() {
        let pairs = strided_timesteps(5, 5);
        assert_eq!(pairs, vec![(4, 3), (3, 2), (2, 1), (1, 0), (0, -1)]);
    }

    #[test]
    fn test_reduced_grid_pairs() {
        // linspace(-1, 999, 11) = -1, 99, 199, ..., 999
        let pairs = strided_timesteps(1000, 10);
        assert_eq!(pairs.len(), 10);
        assert_eq!(pairs[0], (999, 899));
        assert_eq!(pairs[8], (199, 99));
        assert_eq!(pairs[9], (99, -1));

        let pairs = strided_timesteps(10, 3);
        // linspace(-1, 9, 4) = -1, 2.33, 5.67, 9
        assert_eq!(pairs, vec![(9, 5), (5, 2), (2, -1)]);
    }

    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            StridedSampler::new(10, 11, 0.0),
            Err(DiffusionError::SamplingTimesteps { sampling: 11, total: 10 })
        );
        assert_eq!(StridedSampler::new(10, 5, 1.5), Err(DiffusionError::InvalidEta(1.5)));
        assert!(ReverseSampler::select(10, 0, 0.0).is_err());
    }

    #[test]
    fn test_selection() {
        assert!(matches!(
            ReverseSampler::select(10, 10, 0.0).unwrap(),
            ReverseSampler::Ancestral(_)
        ));
        assert!(matches!(
            ReverseSampler::select(10, 4, 0.0).unwrap(),
            ReverseSampler::Strided(_)
        ));
    }

    #[test]
    fn test_eta_zero_is_deterministic() {
        let device = Default::default();
        let schedule = ResidualSchedule::<TestBackend>::new(20, 1.0, &device).unwrap();
        let engine = PosteriorEngine::new(&schedule, &ScaledDenoiser, Mode::generation());
        let sampler = StridedSampler::new(20, 5, 0.0).unwrap();

        let img = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.4, &device);
        let a = sampler
            .denoise(&engine, img.clone(), None, &mut NoiseGenerator::seeded(1), false)
            .unwrap();
        let b = sampler
            .denoise(&engine, img, None, &mut NoiseGenerator::seeded(2), false)
            .unwrap();
        assert_eq!(
            a.image.into_data().to_vec::<f32>().unwrap(),
            b.image.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_full_strided_matches_ancestral_at_eta_one() {
        let device = Default::default();
        let schedule = ResidualSchedule::<TestBackend>::new(10, 1.0, &device).unwrap();
        let mode = Mode::generation().with_clip_denoised(false);
        let engine = PosteriorEngine::new(&schedule, &ScaledDenoiser, mode);

        let img: Tensor<TestBackend, 4> = NoiseGenerator::seeded(3).normal([2, 1, 3, 3], &device);
        let strided = StridedSampler::new(10, 10, 1.0).unwrap();

        let a = strided
            .denoise(&engine, img.clone(), None, &mut NoiseGenerator::seeded(42), true)
            .unwrap();
        let b = AncestralSampler
            .denoise(&engine, img, None, &mut NoiseGenerator::seeded(42), true)
            .unwrap();

        assert_eq!(a.states.len(), b.states.len());
        for (x, y) in a.states.into_iter().zip(b.states) {
            let x = x.into_data().to_vec::<f32>().unwrap();
            let y = y.into_data().to_vec::<f32>().unwrap();
            for (u, v) in x.iter().zip(&y) {
                assert!((u - v).abs() < 1e-3, "{u} vs {v}");
            }
        }
    }
}
