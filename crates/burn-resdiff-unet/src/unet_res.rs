//! Dual-tower U-Net predicting residual and noise
//!
//! Two [`Unet`] towers run side by side: one predicts the residual, the
//! other the noise. After the first ResNet block of every encoder level each
//! tower receives a 1x1 projection of both towers' features, so the two
//! predictions stay coupled while keeping separate weights.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use burn_resdiff_core::{Denoiser, DenoiserOutput, DiffusionError};

use crate::unet::{Skips, Unet, UnetConfig};

/// Residual/noise denoiser built from two cross-connected U-Nets
#[derive(Module, Debug)]
pub struct UnetRes<B: Backend> {
    /// Residual tower
    pub unet0: Unet<B>,
    /// Noise tower
    pub unet1: Unet<B>,
    /// Per-level `[res, eps] -> res` projections
    pub adjust_convs0: Vec<Conv2d<B>>,
    /// Per-level `[eps, res] -> eps` projections
    pub adjust_convs1: Vec<Conv2d<B>>,
    /// Image channels
    pub channels: usize,
    /// Channels of each prediction
    pub out_channels: usize,
    pub self_condition: bool,
}

impl<B: Backend> UnetRes<B> {
    /// Creates the dual-tower network
    ///
    /// # Errors
    ///
    /// [`DiffusionError::UnsupportedConfig`] unless `share_encoder == 0`.
    pub fn new(config: &UnetConfig, device: &B::Device) -> Result<Self, DiffusionError> {
        if config.share_encoder != 0 {
            return Err(DiffusionError::UnsupportedConfig(format!(
                "share_encoder = {} (only 0 is implemented)",
                config.share_encoder
            )));
        }

        let adjust = || -> Vec<Conv2d<B>> {
            config
                .level_dims()
                .iter()
                .map(|&(dim_in, _)| Conv2dConfig::new([2 * dim_in, dim_in], [1, 1]).init(device))
                .collect()
        };

        Ok(Self {
            unet0: Unet::new(config, device),
            unet1: Unet::new(config, device),
            adjust_convs0: adjust(),
            adjust_convs1: adjust(),
            channels: config.channels,
            out_channels: config.out_channels(),
            self_condition: config.self_condition,
        })
    }

    /// Forward pass through both towers
    ///
    /// # Arguments
    ///
    /// * `x` - Sample with conditioning channels stacked after it
    /// * `time` - Per-sample timesteps `[batch]`
    /// * `self_cond` - Predicted start image, fed to both towers
    ///
    /// # Returns
    ///
    /// `(residual, noise)`, each `[batch, out_channels, height, width]`
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        time: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> DenoiserOutput<B> {
        let mut x_res = self.unet0.stem(x.clone(), self_cond.clone());
        let mut x_eps = self.unet1.stem(x, self_cond);
        let init_res = x_res.clone();
        let init_eps = x_eps.clone();

        let t_res = self.unet0.time_embedding(time.clone());
        let t_eps = self.unet1.time_embedding(time);

        let levels = self
            .unet0
            .downs
            .iter()
            .zip(&self.unet1.downs)
            .zip(self.adjust_convs0.iter().zip(&self.adjust_convs1));

        let mut skips_res: Vec<Skips<B>> = Vec::with_capacity(self.unet0.downs.len());
        let mut skips_eps: Vec<Skips<B>> = Vec::with_capacity(self.unet1.downs.len());

        for ((down_res, down_eps), (adjust_res, adjust_eps)) in levels {
            let h_res = down_res.block1.forward(x_res, t_res.clone());
            let h_eps = down_eps.block1.forward(x_eps, t_eps.clone());

            let combined_res = adjust_res.forward(Tensor::cat(vec![h_res.clone(), h_eps.clone()], 1));
            let combined_eps = adjust_eps.forward(Tensor::cat(vec![h_eps, h_res], 1));

            let h2_res = down_res
                .attn
                .forward(down_res.block2.forward(combined_res.clone(), t_res.clone()));
            x_res = down_res.downsample.forward(h2_res.clone());
            skips_res.push((combined_res, h2_res));

            let h2_eps = down_eps
                .attn
                .forward(down_eps.block2.forward(combined_eps.clone(), t_eps.clone()));
            x_eps = down_eps.downsample.forward(h2_eps.clone());
            skips_eps.push((combined_eps, h2_eps));
        }

        let x_res = self.unet0.middle(x_res, t_res.clone());
        let x_res = self.unet0.decode(x_res, skips_res, t_res.clone());
        let res = self.unet0.head(x_res, init_res, t_res);

        let x_eps = self.unet1.middle(x_eps, t_eps.clone());
        let x_eps = self.unet1.decode(x_eps, skips_eps, t_eps.clone());
        let eps = self.unet1.head(x_eps, init_eps, t_eps);

        (res, eps)
    }
}

impl<B: Backend> Denoiser<B> for UnetRes<B> {
    fn channels(&self) -> usize {
        self.channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn self_condition(&self) -> bool {
        self.self_condition
    }

    fn predict(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> DenoiserOutput<B> {
        self.forward(x, t, self_cond)
    }
}
