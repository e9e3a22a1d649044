//! Channel-wise layer normalization
//!
//! Normalizes a feature map across its channel axis at every pixel, with a
//! learned per-channel gain and no bias. Used as the pre-norm of the U-Net
//! attention blocks and after the linear-attention output projection.

use burn::module::Param;
use burn::prelude::*;

/// Layer normalization over the channel dimension of `[batch, channels, h, w]`
///
/// # Formula
///
/// ```text
/// y = (x - mean_c(x)) / sqrt(var_c(x) + eps) * g
/// ```
#[derive(Module, Debug)]
pub struct ChannelLayerNorm<B: Backend> {
    /// Gain, shape [channels]
    pub gain: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> ChannelLayerNorm<B> {
    /// Creates a channel layer norm with unit gain
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            gain: Param::from_tensor(Tensor::ones([channels], device)),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();

        let mean = x.clone().mean_dim(1);
        let diff = x - mean;
        let var = diff.clone().powi_scalar(2).mean_dim(1);

        let gain = self.gain.val().reshape([1, channels, 1, 1]);
        diff / var.add_scalar(self.eps).sqrt() * gain
    }
}
