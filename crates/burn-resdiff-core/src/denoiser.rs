//! The call contract between the diffusion engine and its backbone

use burn::prelude::*;

/// `(predicted residual, predicted noise)`, both `[batch, channels, height, width]`
pub type DenoiserOutput<B> = (Tensor<B, 4>, Tensor<B, 4>);

/// A network estimating the residual and the noise in a corrupted sample.
///
/// The engine only ever calls [`Denoiser::predict`]; weights, devices and
/// gradient tracking stay the implementor's business. Single- and
/// dual-backbone networks are separate implementations of this one trait.
pub trait Denoiser<B: Backend> {
    /// Channels of the images being generated
    fn channels(&self) -> usize;

    /// Channels of each predicted tensor; must equal [`Denoiser::channels`]
    fn out_channels(&self) -> usize;

    /// Whether [`Denoiser::predict`] consumes a self-conditioning image
    fn self_condition(&self) -> bool;

    /// Predicts residual and noise
    ///
    /// # Arguments
    ///
    /// * `x` - Corrupted sample, with conditioning channels stacked after it
    /// * `t` - Per-sample timestep indices `[batch]`
    /// * `self_cond` - Predicted start image; `None` means zeros
    fn predict(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> DenoiserOutput<B>;
}

impl<B: Backend, D: Denoiser<B> + ?Sized> Denoiser<B> for &D {
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn out_channels(&self) -> usize {
        (**self).out_channels()
    }

    fn self_condition(&self) -> bool {
        (**self).self_condition()
    }

    fn predict(
        &self,
        x: Tensor<B, 4>,
        t: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> DenoiserOutput<B> {
        (**self).predict(x, t, self_cond)
    }
}
