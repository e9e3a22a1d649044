//! Training objective
//!
//! One training example: corrupt a clean image with [`q_sample`], ask the
//! denoiser for the residual and the noise, and compare both against the
//! values that were actually used.
//!
//! [`q_sample`]: burn_resdiff_samplers::ResidualSchedule::q_sample

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn_resdiff_core::{
    normalize_to_neg_one_to_one, Conditioning, Denoiser, DiffusionError, NoiseGenerator,
};

use crate::model::ResidualDiffusion;

/// Weight applied to the posterior-mean loss, whose targets are tiny
pub const POSTERIOR_MEAN_LOSS_WEIGHT: f64 = 10000.0;

/// Element-wise distance between prediction and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossType {
    /// Absolute error
    #[default]
    L1,
    /// Squared error
    L2,
}

impl LossType {
    /// Unreduced loss, same shape as the inputs
    pub fn elementwise<B: Backend, const D: usize>(
        &self,
        pred: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let diff = pred - target;
        match self {
            Self::L1 => diff.abs(),
            Self::L2 => diff.powi_scalar(2),
        }
    }
}

impl FromStr for LossType {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => Err(DiffusionError::InvalidLossType(other.to_string())),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "l1"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

/// What the predictions are compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossTarget {
    /// `loss(pred_res, x_res) + loss(pred_noise, noise)`
    #[default]
    ResidualNoise,
    /// Loss between the one-step posterior means implied by the predicted
    /// and the true `(residual, noise)`, times [`POSTERIOR_MEAN_LOSS_WEIGHT`]
    PosteriorMean,
}

/// A training batch in `[0, 1]`
#[derive(Debug, Clone)]
pub struct TrainingBatch<B: Backend> {
    /// Clean images `[batch, channels, height, width]`
    pub target: Tensor<B, 4>,
    /// Degraded inputs (and mask) for conditional models
    pub cond: Option<Conditioning<B>>,
}

impl<B: Backend> TrainingBatch<B> {
    /// Unconditional batch
    pub fn generation(target: Tensor<B, 4>) -> Self {
        Self { target, cond: None }
    }

    /// Conditional batch
    pub fn conditional(target: Tensor<B, 4>, cond: Conditioning<B>) -> Self {
        Self {
            target,
            cond: Some(cond),
        }
    }
}

impl<B: Backend, M: Denoiser<B>> ResidualDiffusion<B, M> {
    /// Loss for one batch at the given timesteps
    ///
    /// # Arguments
    ///
    /// * `x_start` - Clean images in `[-1, 1]`
    /// * `cond` - Degraded input (and mask) in the model's working range
    /// * `t` - Per-sample timesteps `[batch]`
    /// * `noise` - Fixed noise; drawn from `rng` when `None`
    /// * `rng` - Noise source, also decides self-conditioning
    ///
    /// # Returns
    ///
    /// Scalar tensor `[1]`: per-example mean, then batch mean
    pub fn p_losses(
        &self,
        x_start: Tensor<B, 4>,
        cond: Option<&Conditioning<B>>,
        t: Tensor<B, 1, Int>,
        noise: Option<Tensor<B, 4>>,
        rng: &mut NoiseGenerator,
    ) -> Result<Tensor<B, 1>, DiffusionError> {
        let mode = self.mode();
        let schedule = self.schedule();

        let noise = noise.unwrap_or_else(|| rng.normal_like(&x_start));
        let x_input = mode.reference_image(cond, &x_start);
        let x_res = x_input - x_start.clone();
        let x_t = schedule.q_sample(x_start, x_res.clone(), t.clone(), noise.clone());

        let self_cond = if mode.self_condition && rng.coin(0.5) {
            let preds = self
                .engine()
                .model_predictions(x_t.clone(), t.clone(), cond, None)?;
            Some(preds.pred_x_start.detach())
        } else {
            None
        };

        let x_in = mode.denoiser_input(x_t.clone(), cond)?;
        let (pred_res, pred_noise) = self.denoiser().predict(x_in, t.clone(), self_cond);

        let loss_type = self.loss_type();
        let loss = match self.loss_target() {
            LossTarget::ResidualNoise => {
                loss_type.elementwise(pred_res, x_res) + loss_type.elementwise(pred_noise, noise)
            }
            LossTarget::PosteriorMean => {
                let pred_mean =
                    schedule.q_posterior_from_res_noise(pred_res, pred_noise, x_t.clone(), t.clone());
                let true_mean = schedule.q_posterior_from_res_noise(x_res, noise, x_t, t);
                loss_type
                    .elementwise(pred_mean, true_mean)
                    .mul_scalar(POSTERIOR_MEAN_LOSS_WEIGHT)
            }
        };

        let [b, c, h, w] = loss.dims();
        Ok(loss.reshape([b, c * h * w]).mean_dim(1).mean())
    }

    /// Training step entry point: normalizes the batch, draws uniform
    /// timesteps and computes [`ResidualDiffusion::p_losses`]
    pub fn forward(
        &self,
        batch: TrainingBatch<B>,
        rng: &mut NoiseGenerator,
    ) -> Result<Tensor<B, 1>, DiffusionError> {
        let target = normalize_to_neg_one_to_one(batch.target);
        let cond = batch.cond.map(|cond| self.normalize_condition(cond));

        let [batch_size, _, _, _] = target.dims();
        let t = rng.timesteps::<B>(batch_size, self.num_timesteps(), &target.device());

        self.p_losses(target, cond.as_ref(), t, None, rng)
    }
}
