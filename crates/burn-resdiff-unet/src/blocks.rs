//! U-Net building blocks: time embedding, ResNet blocks, attention, resampling

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::{silu, softmax};
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;

use burn_resdiff_core::groupnorm::GroupNorm;
use burn_resdiff_core::layernorm::ChannelLayerNorm;

/// Sinusoidal timestep embedding
///
/// `[sin(t·f_i), cos(t·f_i)]` with `f_i = exp(-ln(10000) · i / (half − 1))`.
///
/// # Arguments
///
/// * `timesteps` - Per-sample timesteps `[batch]`
/// * `dim` - Embedding width, even and at least 4
///
/// # Returns
///
/// Embedding of shape `[batch, dim]`
pub fn sinusoidal_embedding<B: Backend>(timesteps: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let half_dim = dim / 2;
    let scale = 10000f64.ln() / (half_dim as f64 - 1.0);

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-(i as f64) * scale).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), &timesteps.device());

    let [batch] = timesteps.dims();
    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
}

/// Convolution whose kernel is standardized per output channel before use
///
/// Each output filter is shifted to zero mean and scaled to unit (biased)
/// variance. Pairs with the GroupNorm that follows it in [`Block`].
#[derive(Module, Debug)]
pub struct WeightStandardizedConv2d<B: Backend> {
    /// Underlying convolution holding the raw kernel and bias
    pub conv: Conv2d<B>,
    /// Padding on each side
    pub padding: usize,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> WeightStandardizedConv2d<B> {
    /// Creates a `kernel x kernel` convolution with "same" padding
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, device: &B::Device) -> Self {
        let padding = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);
        Self {
            conv,
            padding,
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let weight = self.conv.weight.val();
        let [out, inp, kh, kw] = weight.dims();

        let flat = weight.reshape([out, inp * kh * kw]);
        let mean = flat.clone().mean_dim(1);
        let diff = flat - mean;
        let var = diff.clone().powi_scalar(2).mean_dim(1);
        let weight = (diff / var.add_scalar(self.eps).sqrt()).reshape([out, inp, kh, kw]);

        let bias = self.conv.bias.as_ref().map(|b| b.val());
        let options = ConvOptions::new([1, 1], [self.padding, self.padding], [1, 1], 1);
        conv2d(x, weight, bias, options)
    }
}

/// WS-conv 3x3, GroupNorm, optional scale/shift, SiLU
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    pub proj: WeightStandardizedConv2d<B>,
    pub norm: GroupNorm<B>,
}

impl<B: Backend> Block<B> {
    pub fn new(dim: usize, dim_out: usize, groups: usize, device: &B::Device) -> Self {
        Self {
            proj: WeightStandardizedConv2d::new(dim, dim_out, 3, device),
            norm: GroupNorm::new(groups, dim_out, device),
        }
    }

    /// # Arguments
    ///
    /// * `x` - Input `[batch, dim, height, width]`
    /// * `scale_shift` - Per-channel `(scale, shift)`, each `[batch, dim_out, 1, 1]`
    pub fn forward(&self, x: Tensor<B, 4>, scale_shift: Option<(Tensor<B, 4>, Tensor<B, 4>)>) -> Tensor<B, 4> {
        let x = self.norm.forward(self.proj.forward(x));

        let x = match scale_shift {
            Some((scale, shift)) => x * scale.add_scalar(1.0) + shift,
            None => x,
        };

        silu(x)
    }
}

/// ResNet block conditioned on the time embedding through scale and shift
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    /// Time embedding projection to `2 * dim_out` (scale, shift)
    pub mlp: Linear<B>,
    pub block1: Block<B>,
    pub block2: Block<B>,
    /// Skip connection convolution (when dim != dim_out)
    pub res_conv: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    /// Creates a new residual block
    ///
    /// # Arguments
    ///
    /// * `dim` - Number of input channels
    /// * `dim_out` - Number of output channels
    /// * `time_emb_dim` - Width of the time embedding
    /// * `groups` - GroupNorm groups
    /// * `device` - Device to create tensors on
    pub fn new(dim: usize, dim_out: usize, time_emb_dim: usize, groups: usize, device: &B::Device) -> Self {
        let res_conv = if dim != dim_out {
            Some(Conv2dConfig::new([dim, dim_out], [1, 1]).init(device))
        } else {
            None
        };

        Self {
            mlp: LinearConfig::new(time_emb_dim, dim_out * 2).init(device),
            block1: Block::new(dim, dim_out, groups, device),
            block2: Block::new(dim_out, dim_out, groups, device),
            res_conv,
        }
    }

    /// Forward pass through the residual block
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, dim, height, width]`
    /// * `time_emb` - Time embedding of shape `[batch, time_emb_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, dim_out, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>, time_emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let time_emb = self.mlp.forward(silu(time_emb));
        let [b, width] = time_emb.dims();
        let half = width / 2;
        let time_emb = time_emb.reshape([b, width, 1, 1]);
        let scale = time_emb.clone().narrow(1, 0, half);
        let shift = time_emb.narrow(1, half, half);

        let residual = match &self.res_conv {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let h = self.block1.forward(x, Some((scale, shift)));
        let h = self.block2.forward(h, None);

        h + residual
    }
}

/// Splits a fused `qkv` projection into per-head `[batch, heads, dim_head, h*w]` tensors
fn split_qkv<B: Backend>(qkv: Tensor<B, 4>, heads: usize) -> [Tensor<B, 4>; 3] {
    let [b, c, h, w] = qkv.dims();
    let hidden = c / 3;
    let dim_head = hidden / heads;
    [0, 1, 2].map(|i| {
        qkv.clone()
            .narrow(1, i * hidden, hidden)
            .reshape([b, heads, dim_head, h * w])
    })
}

/// Linear-complexity attention over spatial positions
#[derive(Module, Debug)]
pub struct LinearAttention<B: Backend> {
    pub to_qkv: Conv2d<B>,
    pub to_out: Conv2d<B>,
    pub out_norm: ChannelLayerNorm<B>,
    pub heads: usize,
    pub dim_head: usize,
}

impl<B: Backend> LinearAttention<B> {
    pub fn new(dim: usize, heads: usize, dim_head: usize, device: &B::Device) -> Self {
        let hidden = heads * dim_head;
        Self {
            to_qkv: Conv2dConfig::new([dim, hidden * 3], [1, 1])
                .with_bias(false)
                .init(device),
            to_out: Conv2dConfig::new([hidden, dim], [1, 1]).init(device),
            out_norm: ChannelLayerNorm::new(dim, device),
            heads,
            dim_head,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, _, h, w] = x.dims();
        let scale = (self.dim_head as f64).powf(-0.5);

        let [q, k, v] = split_qkv(self.to_qkv.forward(x), self.heads);

        // Features normalized for q, positions for k
        let q = softmax(q, 2).mul_scalar(scale);
        let k = softmax(k, 3);
        let v = v.div_scalar((h * w) as f64);

        // [b, heads, d, e]
        let context = k.matmul(v.swap_dims(2, 3));
        // [b, heads, e, n]
        let out = context.swap_dims(2, 3).matmul(q);

        let out = out.reshape([b, self.heads * self.dim_head, h, w]);
        self.out_norm.forward(self.to_out.forward(out))
    }
}

/// Full softmax self-attention over spatial positions
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub to_qkv: Conv2d<B>,
    pub to_out: Conv2d<B>,
    pub heads: usize,
    pub dim_head: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(dim: usize, heads: usize, dim_head: usize, device: &B::Device) -> Self {
        let hidden = heads * dim_head;
        Self {
            to_qkv: Conv2dConfig::new([dim, hidden * 3], [1, 1])
                .with_bias(false)
                .init(device),
            to_out: Conv2dConfig::new([hidden, dim], [1, 1]).init(device),
            heads,
            dim_head,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, _, h, w] = x.dims();
        let scale = (self.dim_head as f64).powf(-0.5);

        let [q, k, v] = split_qkv(self.to_qkv.forward(x), self.heads);
        let q = q.mul_scalar(scale);

        // [b, heads, i, j]
        let attn = softmax(q.swap_dims(2, 3).matmul(k), 3);
        // [b, heads, i, d] -> [b, heads, d, i]
        let out = attn.matmul(v.swap_dims(2, 3)).swap_dims(2, 3);

        let out = out.reshape([b, self.heads * self.dim_head, h, w]);
        self.to_out.forward(out)
    }
}

/// `x + LinearAttention(LayerNorm(x))`
#[derive(Module, Debug)]
pub struct LinearAttentionBlock<B: Backend> {
    pub norm: ChannelLayerNorm<B>,
    pub attn: LinearAttention<B>,
}

impl<B: Backend> LinearAttentionBlock<B> {
    pub fn new(dim: usize, heads: usize, dim_head: usize, device: &B::Device) -> Self {
        Self {
            norm: ChannelLayerNorm::new(dim, device),
            attn: LinearAttention::new(dim, heads, dim_head, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.attn.forward(self.norm.forward(x.clone())) + x
    }
}

/// `x + Attention(LayerNorm(x))`
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    pub norm: ChannelLayerNorm<B>,
    pub attn: Attention<B>,
}

impl<B: Backend> AttentionBlock<B> {
    pub fn new(dim: usize, heads: usize, dim_head: usize, device: &B::Device) -> Self {
        Self {
            norm: ChannelLayerNorm::new(dim, device),
            attn: Attention::new(dim, heads, dim_head, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.attn.forward(self.norm.forward(x.clone())) + x
    }
}

/// Downsample block (strided conv), or a plain 3x3 conv at the deepest level
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    /// 4x4 convolution with stride 2 (2x spatial reduction)
    pub fn new(dim: usize, dim_out: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([dim, dim_out], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }

    /// 3x3 convolution keeping the resolution
    pub fn same_resolution(dim: usize, dim_out: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([dim, dim_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// Nearest-neighbour upsample followed by a 3x3 conv
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    pub conv: Conv2d<B>,
    /// 2 for a 2x upsample, 1 to keep the resolution
    pub scale_factor: usize,
}

impl<B: Backend> Upsample<B> {
    /// Creates a new upsample block (2x spatial increase)
    pub fn new(dim: usize, dim_out: usize, device: &B::Device) -> Self {
        Self {
            conv: Self::conv3x3(dim, dim_out, device),
            scale_factor: 2,
        }
    }

    /// 3x3 convolution keeping the resolution
    pub fn same_resolution(dim: usize, dim_out: usize, device: &B::Device) -> Self {
        Self {
            conv: Self::conv3x3(dim, dim_out, device),
            scale_factor: 1,
        }
    }

    fn conv3x3(dim: usize, dim_out: usize, device: &B::Device) -> Conv2d<B> {
        Conv2dConfig::new([dim, dim_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device)
    }

    /// # Returns
    ///
    /// `[batch, dim_out, height * scale, width * scale]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.scale_factor > 1 {
            nearest_upsample(x, self.scale_factor)
        } else {
            x
        };
        self.conv.forward(x)
    }
}

/// Nearest-neighbour upsample by an integer factor
pub fn nearest_upsample<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h, 1, w, 1])
        .repeat_dim(3, factor)
        .repeat_dim(5, factor)
        .reshape([b, c, h * factor, w * factor])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_sinusoidal_embedding() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 10.0], &device);
        let emb = sinusoidal_embedding(t, 16);
        assert_eq!(emb.dims(), [2, 16]);

        // t = 0: sin half is zero, cos half is one
        let values = emb.into_data().to_vec::<f32>().unwrap();
        assert!(values[..8].iter().all(|v| v.abs() < 1e-6));
        assert!(values[8..16].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_weight_standardized_conv_shape() {
        let device = Default::default();
        let conv = WeightStandardizedConv2d::<TestBackend>::new(4, 8, 3, &device);
        let x = Tensor::<TestBackend, 4>::ones([2, 4, 6, 6], &device);
        assert_eq!(conv.forward(x).dims(), [2, 8, 6, 6]);
    }

    #[test]
    fn test_resnet_block_shape() {
        let device = Default::default();
        let block = ResnetBlock::<TestBackend>::new(8, 16, 32, 8, &device);
        let x = Tensor::<TestBackend, 4>::ones([2, 8, 4, 4], &device);
        let t = Tensor::<TestBackend, 2>::ones([2, 32], &device);
        assert_eq!(block.forward(x, t).dims(), [2, 16, 4, 4]);
    }

    #[test]
    fn test_attention_shapes() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 4, 4], &device);

        let linear = LinearAttentionBlock::<TestBackend>::new(8, 2, 4, &device);
        assert_eq!(linear.forward(x.clone()).dims(), [1, 8, 4, 4]);

        let full = AttentionBlock::<TestBackend>::new(8, 2, 4, &device);
        assert_eq!(full.forward(x).dims(), [1, 8, 4, 4]);
    }

    #[test]
    fn test_resampling() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 8, 8], &device);

        let down = Downsample::<TestBackend>::new(8, 16, &device);
        assert_eq!(down.forward(x.clone()).dims(), [1, 16, 4, 4]);

        let up = Upsample::<TestBackend>::new(8, 4, &device);
        assert_eq!(up.forward(x.clone()).dims(), [1, 4, 16, 16]);

        let same = Upsample::<TestBackend>::same_resolution(8, 4, &device);
        assert_eq!(same.forward(x).dims(), [1, 4, 8, 8]);
    }

    #[test]
    fn test_nearest_upsample_repeats_pixels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device).reshape([1, 1, 2, 2]);
        let values = nearest_upsample(x, 2).into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            values,
            vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0]
        );
    }
}
