//! Cross-derivations between residual, noise and start image, and the
//! closed-form posterior `q(x_{t-1} | x_t, x_0, x_res)`
//!
//! Given `x_t` and any two of `{x_start, x_res, noise}` (or `x_input`), the
//! forward equation fixes the third. The samplers rely on these identities to
//! turn a denoiser prediction into a step of the reverse chain.

use burn::prelude::*;
use burn_resdiff_core::{Conditioning, Denoiser, DiffusionError, Mode};

use crate::schedule::{extract, ResidualSchedule};

/// Denoiser output after clipping, with the implied start image
#[derive(Debug, Clone)]
pub struct ModelPrediction<B: Backend> {
    /// Predicted residual, clamped to `[-1, 1]` when clipping is enabled
    pub pred_res: Tensor<B, 4>,
    /// Predicted noise, never clamped
    pub pred_noise: Tensor<B, 4>,
    /// Start image implied by `pred_res` and `pred_noise`
    pub pred_x_start: Tensor<B, 4>,
}

/// Mean and variance of the reverse-step Gaussian
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    pub mean: Tensor<B, 4>,
    /// Broadcastable `[batch, 1, 1, 1]`
    pub variance: Tensor<B, 4>,
    /// Broadcastable `[batch, 1, 1, 1]`, floored before the log
    pub log_variance: Tensor<B, 4>,
}

impl<B: Backend> ResidualSchedule<B> {
    /// `noise = (x_t − x_input − (ᾱ_t − 1) · pred_res) / β̄_t`
    pub fn predict_noise_from_res(
        &self,
        x_t: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        x_input: Tensor<B, 4>,
        pred_res: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let tensors = self.tensors();
        let alphas_cumsum = extract(&tensors.alphas_cumsum, t.clone());
        let betas_cumsum = extract(&tensors.betas_cumsum, t);
        (x_t - x_input - alphas_cumsum.sub_scalar(1.0) * pred_res) / betas_cumsum
    }

    /// `x_start = (x_t − ᾱ_t · x_input − β̄_t · noise) / (1 − ᾱ_t)`
    ///
    /// The last step divides by a small epsilon instead of zero.
    pub fn predict_start_from_xinput_noise(
        &self,
        x_t: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        x_input: Tensor<B, 4>,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let tensors = self.tensors();
        let alphas_cumsum = extract(&tensors.alphas_cumsum, t.clone());
        let betas_cumsum = extract(&tensors.betas_cumsum, t.clone());
        let one_minus = extract(&tensors.one_minus_alphas_cumsum, t);
        (x_t - alphas_cumsum * x_input - betas_cumsum * noise) / one_minus
    }

    /// `x_start = x_t − ᾱ_t · x_res − β̄_t · noise`
    pub fn predict_start_from_res_noise(
        &self,
        x_t: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        x_res: Tensor<B, 4>,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let tensors = self.tensors();
        x_t - extract(&tensors.alphas_cumsum, t.clone()) * x_res
            - extract(&tensors.betas_cumsum, t) * noise
    }

    /// Posterior mean written in terms of residual and noise
    ///
    /// `x_t − α_t · x_res − (β_t² / β̄_t) · noise`
    pub fn q_posterior_from_res_noise(
        &self,
        x_res: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        let tensors = self.tensors();
        let alphas = extract(&tensors.alphas, t.clone());
        let betas2 = extract(&tensors.betas2, t.clone());
        let betas_cumsum = extract(&tensors.betas_cumsum, t);
        x_t - alphas * x_res - (betas2 / betas_cumsum) * noise
    }

    /// Posterior `q(x_{t-1} | x_t, x_start, x_res)`
    ///
    /// `mean = coef1 · x_t + coef2 · pred_res + coef3 · x_start`
    pub fn q_posterior(
        &self,
        pred_res: Tensor<B, 4>,
        x_start: Tensor<B, 4>,
        x_t: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
    ) -> Posterior<B> {
        let tensors = self.tensors();
        let mean = extract(&tensors.posterior_mean_coef1, t.clone()) * x_t
            + extract(&tensors.posterior_mean_coef2, t.clone()) * pred_res
            + extract(&tensors.posterior_mean_coef3, t.clone()) * x_start;

        Posterior {
            mean,
            variance: extract(&tensors.posterior_variance, t.clone()),
            log_variance: extract(&tensors.posterior_log_variance_clipped, t),
        }
    }
}

/// Runs the denoiser and turns its output into reverse-step statistics
///
/// Borrowed view over a schedule, a denoiser and the mode they were
/// validated against. Cheap to build per sampling call.
pub struct PosteriorEngine<'a, B: Backend, M> {
    schedule: &'a ResidualSchedule<B>,
    denoiser: &'a M,
    mode: Mode,
}

impl<'a, B: Backend, M: Denoiser<B>> PosteriorEngine<'a, B, M> {
    pub fn new(schedule: &'a ResidualSchedule<B>, denoiser: &'a M, mode: Mode) -> Self {
        Self {
            schedule,
            denoiser,
            mode,
        }
    }

    pub fn schedule(&self) -> &'a ResidualSchedule<B> {
        self.schedule
    }

    pub fn denoiser(&self) -> &'a M {
        self.denoiser
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Calls the denoiser on `x` at timesteps `t`
    ///
    /// Conditioning channels are stacked after `x`. When clipping is on,
    /// the residual and the derived start image are clamped to `[-1, 1]`;
    /// the noise estimate never is.
    pub fn model_predictions(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        cond: Option<&Conditioning<B>>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> Result<ModelPrediction<B>, DiffusionError> {
        let x_in = self.mode.denoiser_input(x.clone(), cond)?;
        let self_cond = if self.mode.self_condition { self_cond } else { None };

        let (pred_res, pred_noise) = self.denoiser.predict(x_in, t.clone(), self_cond);
        let pred_res = self.maybe_clip(pred_res);

        let pred_x_start = self
            .schedule
            .predict_start_from_res_noise(x, t, pred_res.clone(), pred_noise.clone());
        let pred_x_start = self.maybe_clip(pred_x_start);

        Ok(ModelPrediction {
            pred_res,
            pred_noise,
            pred_x_start,
        })
    }

    /// Model predictions plugged into [`ResidualSchedule::q_posterior`]
    pub fn p_mean_variance(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        cond: Option<&Conditioning<B>>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> Result<(Posterior<B>, ModelPrediction<B>), DiffusionError> {
        let preds = self.model_predictions(x.clone(), t.clone(), cond, self_cond)?;
        let posterior = self.schedule.q_posterior(
            preds.pred_res.clone(),
            preds.pred_x_start.clone(),
            x,
            t,
        );
        Ok((posterior, preds))
    }

    fn maybe_clip(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.mode.clip_denoised {
            x.clamp(-1.0, 1.0)
        } else {
            x
        }
    }
}
