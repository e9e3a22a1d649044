//! Group normalization implementation
//!
//! Divides channels into groups and normalizes within each group, as used
//! inside the U-Net ResNet blocks.

use burn::module::Param;
use burn::prelude::*;

/// Group normalization module
///
/// Works well with the small batch sizes typical of diffusion training,
/// where batch normalization statistics are too noisy.
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Param<Tensor<B, 1>>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups to divide channels into
    /// * `num_channels` - Total number of input channels (must be divisible by num_groups)
    /// * `device` - Device to create tensors on
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Self {
        assert!(
            num_channels % num_groups == 0,
            "{num_channels} channels cannot be split into {num_groups} groups"
        );
        Self {
            num_groups,
            weight: Param::from_tensor(Tensor::ones([num_channels], device)),
            bias: Param::from_tensor(Tensor::zeros([num_channels], device)),
            eps: 1e-5,
        }
    }

    /// Applies group normalization to a 4D tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        let x = x.reshape([batch, self.num_groups, group_size * height * width]);

        // Biased variance, matching the usual GroupNorm definition
        let mean = x.clone().mean_dim(2);
        let diff = x - mean;
        let var = diff.clone().powi_scalar(2).mean_dim(2);

        let x = diff / var.add_scalar(self.eps).sqrt();
        let x = x.reshape([batch, channels, height, width]);

        let weight = self.weight.val().reshape([1, channels, 1, 1]);
        let bias = self.bias.val().reshape([1, channels, 1, 1]);

        x * weight + bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_groupnorm_shape_and_statistics() {
        let device = Default::default();
        let norm = GroupNorm::<TestBackend>::new(2, 4, &device);

        let x = Tensor::<TestBackend, 1>::from_floats(
            [
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, // group 0
                -4.0, 0.0, 4.0, 8.0, 2.0, 2.0, 6.0, 6.0, // group 1
            ],
            &device,
        )
        .reshape([1, 4, 2, 2]);

        let out = norm.forward(x);
        assert_eq!(out.dims(), [1, 4, 2, 2]);

        let values = out.into_data().to_vec::<f32>().unwrap();
        for group in values.chunks(8) {
            let mean = group.iter().sum::<f32>() / 8.0;
            let var = group.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }
}
