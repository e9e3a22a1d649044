//! Forward (noising) process

use burn::prelude::*;
use burn_resdiff_core::NoiseGenerator;

use crate::schedule::{extract, ResidualSchedule};

impl<B: Backend> ResidualSchedule<B> {
    /// Samples `x_t ~ q(x_t | x_0, x_res)` in closed form
    ///
    /// ```text
    /// x_t = x_start + ᾱ_t · x_res + β̄_t · noise
    /// ```
    ///
    /// # Arguments
    ///
    /// * `x_start` - Clean image `[batch, channels, height, width]`
    /// * `x_res` - Residual `x_input − x_start`
    /// * `t` - Per-sample timesteps `[batch]`
    /// * `noise` - Standard Gaussian noise shaped like `x_start`
    pub fn q_sample(
        &self,
        x_start: Tensor<B, 4>,
        x_res: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let tensors = self.tensors();
        x_start
            + extract(&tensors.alphas_cumsum, t.clone()) * x_res
            + extract(&tensors.betas_cumsum, t) * noise
    }

    /// [`ResidualSchedule::q_sample`] with fresh noise, returned alongside `x_t`
    pub fn q_sample_random(
        &self,
        x_start: Tensor<B, 4>,
        x_res: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        rng: &mut NoiseGenerator,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let noise = rng.normal_like(&x_start);
        (self.q_sample(x_start, x_res, t, noise.clone()), noise)
    }
}
