//! Single-tower U-Net
//!
//! Encoder/decoder with skip connections, linear attention at every level
//! and full attention in the middle. Used as a tower of [`crate::UnetRes`].

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use crate::blocks::{
    sinusoidal_embedding, AttentionBlock, Downsample, LinearAttentionBlock, ResnetBlock, Upsample,
};

/// U-Net configuration
#[derive(Debug, Clone)]
pub struct UnetConfig {
    /// Base channel width
    pub dim: usize,
    /// Width after the input convolution (defaults to `dim`)
    pub init_dim: Option<usize>,
    /// Output channels (defaults to `channels`)
    pub out_dim: Option<usize>,
    /// Channel multipliers per resolution level
    pub dim_mults: Vec<usize>,
    /// Image channels
    pub channels: usize,
    /// Accept a predicted start image as extra input
    pub self_condition: bool,
    /// GroupNorm groups in every ResNet block
    pub resnet_block_groups: usize,
    /// A degraded input is stacked after the sample
    pub condition: bool,
    /// A mask is stacked after the degraded input
    pub input_condition: bool,
    /// Attention heads
    pub attn_heads: usize,
    /// Attention head dimension
    pub attn_dim_head: usize,
    /// Encoder sharing between the two towers of [`crate::UnetRes`]; only 0 is supported
    pub share_encoder: usize,
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self {
            dim: 64,
            init_dim: None,
            out_dim: None,
            dim_mults: vec![1, 2, 4, 8],
            channels: 3,
            self_condition: false,
            resnet_block_groups: 8,
            condition: false,
            input_condition: false,
            attn_heads: 4,
            attn_dim_head: 32,
            share_encoder: 0,
        }
    }
}

impl UnetConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn with_dim_mults(mut self, dim_mults: Vec<usize>) -> Self {
        self.dim_mults = dim_mults;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_out_dim(mut self, out_dim: usize) -> Self {
        self.out_dim = Some(out_dim);
        self
    }

    pub fn with_self_condition(mut self, self_condition: bool) -> Self {
        self.self_condition = self_condition;
        self
    }

    pub fn with_condition(mut self, condition: bool) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_input_condition(mut self, input_condition: bool) -> Self {
        self.input_condition = input_condition;
        self
    }

    pub fn with_resnet_block_groups(mut self, groups: usize) -> Self {
        self.resnet_block_groups = groups;
        self
    }

    pub fn with_attention(mut self, heads: usize, dim_head: usize) -> Self {
        self.attn_heads = heads;
        self.attn_dim_head = dim_head;
        self
    }

    pub fn with_share_encoder(mut self, share_encoder: usize) -> Self {
        self.share_encoder = share_encoder;
        self
    }

    /// Channels seen by the input convolution
    pub fn input_channels(&self) -> usize {
        let stacked = 1
            + usize::from(self.self_condition)
            + usize::from(self.condition)
            + usize::from(self.input_condition);
        self.channels * stacked
    }

    pub fn init_dim(&self) -> usize {
        self.init_dim.unwrap_or(self.dim)
    }

    pub fn out_channels(&self) -> usize {
        self.out_dim.unwrap_or(self.channels)
    }

    /// `(dim_in, dim_out)` per resolution level
    pub fn level_dims(&self) -> Vec<(usize, usize)> {
        let dims: Vec<usize> = std::iter::once(self.init_dim())
            .chain(self.dim_mults.iter().map(|m| self.dim * m))
            .collect();
        dims.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Creates a U-Net
    pub fn init<B: Backend>(&self, device: &B::Device) -> Unet<B> {
        Unet::new(self, device)
    }
}

/// One encoder level: two ResNet blocks, linear attention, downsample
#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    pub block1: ResnetBlock<B>,
    pub block2: ResnetBlock<B>,
    pub attn: LinearAttentionBlock<B>,
    pub downsample: Downsample<B>,
}

/// One decoder level, mirroring [`DownLevel`]
#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    pub block1: ResnetBlock<B>,
    pub block2: ResnetBlock<B>,
    pub attn: LinearAttentionBlock<B>,
    pub upsample: Upsample<B>,
}

/// Skip features saved by one encoder level: after block1, after attention
pub type Skips<B> = (Tensor<B, 4>, Tensor<B, 4>);

/// U-Net noise/residual predictor
#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    /// Input convolution (7x7)
    pub init_conv: Conv2d<B>,
    /// Time MLP first linear layer
    pub time_mlp_1: Linear<B>,
    /// Time MLP second linear layer
    pub time_mlp_2: Linear<B>,
    /// Encoder path
    pub downs: Vec<DownLevel<B>>,
    pub mid_block1: ResnetBlock<B>,
    pub mid_attn: AttentionBlock<B>,
    pub mid_block2: ResnetBlock<B>,
    /// Decoder path
    pub ups: Vec<UpLevel<B>>,
    /// ResNet block over `[x, init features]`
    pub final_res_block: ResnetBlock<B>,
    /// Output projection (1x1)
    pub final_conv: Conv2d<B>,
    /// Base channel width
    pub dim: usize,
    /// Image channels
    pub channels: usize,
    pub self_condition: bool,
}

impl<B: Backend> Unet<B> {
    /// Creates a new U-Net
    ///
    /// # Arguments
    ///
    /// * `config` - U-Net configuration
    /// * `device` - Device to create tensors on
    pub fn new(config: &UnetConfig, device: &B::Device) -> Self {
        let dim = config.dim;
        let time_dim = dim * 4;
        let groups = config.resnet_block_groups;
        let (heads, dim_head) = (config.attn_heads, config.attn_dim_head);
        let resnet = |d_in, d_out| ResnetBlock::new(d_in, d_out, time_dim, groups, device);

        let init_conv = Conv2dConfig::new([config.input_channels(), config.init_dim()], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);

        let in_out = config.level_dims();
        let num_levels = in_out.len();

        let downs = in_out
            .iter()
            .enumerate()
            .map(|(level, &(dim_in, dim_out))| DownLevel {
                block1: resnet(dim_in, dim_in),
                block2: resnet(dim_in, dim_in),
                attn: LinearAttentionBlock::new(dim_in, heads, dim_head, device),
                downsample: if level + 1 < num_levels {
                    Downsample::new(dim_in, dim_out, device)
                } else {
                    Downsample::same_resolution(dim_in, dim_out, device)
                },
            })
            .collect();

        let mid_dim = in_out.last().map_or(config.init_dim(), |&(_, d)| d);

        let ups = in_out
            .iter()
            .rev()
            .enumerate()
            .map(|(level, &(dim_in, dim_out))| UpLevel {
                block1: resnet(dim_out + dim_in, dim_out),
                block2: resnet(dim_out + dim_in, dim_out),
                attn: LinearAttentionBlock::new(dim_out, heads, dim_head, device),
                upsample: if level + 1 < num_levels {
                    Upsample::new(dim_out, dim_in, device)
                } else {
                    Upsample::same_resolution(dim_out, dim_in, device)
                },
            })
            .collect();

        Self {
            init_conv,
            time_mlp_1: LinearConfig::new(dim, time_dim).init(device),
            time_mlp_2: LinearConfig::new(time_dim, time_dim).init(device),
            downs,
            mid_block1: resnet(mid_dim, mid_dim),
            mid_attn: AttentionBlock::new(mid_dim, heads, dim_head, device),
            mid_block2: resnet(mid_dim, mid_dim),
            ups,
            final_res_block: resnet(config.init_dim() * 2, dim),
            final_conv: Conv2dConfig::new([dim, config.out_channels()], [1, 1]).init(device),
            dim,
            channels: config.channels,
            self_condition: config.self_condition,
        }
    }

    /// Sinusoidal embedding through the time MLP, `[batch, 4 * dim]`
    pub fn time_embedding(&self, time: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let emb = sinusoidal_embedding(time.float(), self.dim);
        self.time_mlp_2.forward(gelu(self.time_mlp_1.forward(emb)))
    }

    /// Prepends the self-conditioning image (zeros when absent) and applies
    /// the input convolution
    pub fn stem(&self, x: Tensor<B, 4>, self_cond: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = if self.self_condition {
            let [b, _, h, w] = x.dims();
            let self_cond =
                self_cond.unwrap_or_else(|| Tensor::zeros([b, self.channels, h, w], &x.device()));
            Tensor::cat(vec![self_cond, x], 1)
        } else {
            x
        };
        self.init_conv.forward(x)
    }

    /// Middle block: ResNet, attention, ResNet
    pub fn middle(&self, x: Tensor<B, 4>, t: Tensor<B, 2>) -> Tensor<B, 4> {
        let x = self.mid_block1.forward(x, t.clone());
        let x = self.mid_attn.forward(x);
        self.mid_block2.forward(x, t)
    }

    /// Decoder path consuming the encoder skips, deepest level first
    pub fn decode(&self, x: Tensor<B, 4>, skips: Vec<Skips<B>>, t: Tensor<B, 2>) -> Tensor<B, 4> {
        self.ups
            .iter()
            .zip(skips.into_iter().rev())
            .fold(x, |x, (level, (h1, h2))| {
                let x = level.block1.forward(Tensor::cat(vec![x, h2], 1), t.clone());
                let x = level.block2.forward(Tensor::cat(vec![x, h1], 1), t.clone());
                let x = level.attn.forward(x);
                level.upsample.forward(x)
            })
    }

    /// Final ResNet block over `[x, init features]` and output projection
    pub fn head(&self, x: Tensor<B, 4>, init: Tensor<B, 4>, t: Tensor<B, 2>) -> Tensor<B, 4> {
        let x = self.final_res_block.forward(Tensor::cat(vec![x, init], 1), t);
        self.final_conv.forward(x)
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Sample with conditioning channels stacked after it
    /// * `time` - Per-sample timesteps `[batch]`
    /// * `self_cond` - Predicted start image `[batch, channels, h, w]`
    ///
    /// # Returns
    ///
    /// Prediction of shape `[batch, out_dim, height, width]`
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        time: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let x = self.stem(x, self_cond);
        let init = x.clone();
        let t = self.time_embedding(time);

        let mut skips = Vec::with_capacity(self.downs.len());
        let mut x = x;
        for level in &self.downs {
            let h1 = level.block1.forward(x, t.clone());
            let h2 = level.attn.forward(level.block2.forward(h1.clone(), t.clone()));
            x = level.downsample.forward(h2.clone());
            skips.push((h1, h2));
        }

        let x = self.middle(x, t.clone());
        let x = self.decode(x, skips, t.clone());
        self.head(x, init, t)
    }
}
