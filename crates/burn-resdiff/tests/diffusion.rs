//! End-to-end tests of training loss and sampling with lightweight denoisers.

use std::cell::RefCell;

use burn::prelude::*;
use burn_ndarray::NdArray;
use burn_resdiff::{
    Conditioning, Denoiser, DenoiserOutput, DiffusionError, LossTarget, NoiseGenerator,
    ResidualDiffusionConfig, ReverseSampler, StridedSampler, TrainingBatch,
};

type TestBackend = NdArray<f32>;

/// Residual and noise proportional to the sample channels
struct ScaledDenoiser {
    channels: usize,
    out_channels: usize,
    self_condition: bool,
    /// Whether each call received a self-conditioning image
    self_cond_seen: RefCell<Vec<bool>>,
}

impl ScaledDenoiser {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            out_channels: channels,
            self_condition: false,
            self_cond_seen: RefCell::new(Vec::new()),
        }
    }

    fn with_self_condition(mut self) -> Self {
        self.self_condition = true;
        self
    }
}

impl<B: Backend> Denoiser<B> for ScaledDenoiser {
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
        _t: Tensor<B, 1, Int>,
        self_cond: Option<Tensor<B, 4>>,
    ) -> DenoiserOutput<B> {
        self.self_cond_seen.borrow_mut().push(self_cond.is_some());
        let sample = x.narrow(1, 0, self.channels);
        (sample.clone().mul_scalar(-0.5), sample.mul_scalar(0.3))
    }
}

fn uniform_images(rng: &mut NoiseGenerator, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
    // Squash Gaussian noise into [0, 1]
    let noise: Tensor<TestBackend, 4> = rng.normal(shape, &Default::default());
    noise.mul_scalar(0.25).add_scalar(0.5).clamp(0.0, 1.0)
}

fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
    x.into_data().to_vec::<f32>().unwrap()
}

fn scalar(x: Tensor<TestBackend, 1>) -> f32 {
    x.into_data().to_vec::<f32>().unwrap()[0]
}

// ============================================================================
// Training loss
// ============================================================================

#[test]
fn test_p_losses_is_finite_scalar() {
    let device = Default::default();
    let model = ResidualDiffusionConfig::new(64)
        .with_num_timesteps(1000)
        .with_loss_type("l1")
        .init::<TestBackend, _>(ScaledDenoiser::new(3), &device)
        .unwrap();

    let mut rng = NoiseGenerator::seeded(0);
    let x_start = uniform_images(&mut rng, [4, 3, 64, 64]).mul_scalar(2.0).sub_scalar(1.0);
    let noise = rng.normal([4, 3, 64, 64], &device);
    let t = Tensor::<TestBackend, 1, Int>::from_data(
        TensorData::new(vec![0i64, 250, 500, 999], [4]),
        &device,
    );

    let loss = model.p_losses(x_start, None, t, Some(noise), &mut rng).unwrap();
    assert_eq!(loss.dims(), [1]);

    let loss = scalar(loss);
    assert!(loss.is_finite());
    assert!(loss >= 0.0);
}

#[test]
fn test_l2_loss_and_posterior_mean_target() {
    let device = Default::default();
    let mut rng = NoiseGenerator::seeded(1);
    let target = uniform_images(&mut rng, [2, 3, 8, 8]);

    for loss_target in [LossTarget::ResidualNoise, LossTarget::PosteriorMean] {
        let model = ResidualDiffusionConfig::new(8)
            .with_num_timesteps(50)
            .with_loss_type("l2")
            .with_loss_target(loss_target)
            .init::<TestBackend, _>(ScaledDenoiser::new(3), &device)
            .unwrap();

        let loss = scalar(
            model
                .forward(TrainingBatch::generation(target.clone()), &mut rng)
                .unwrap(),
        );
        assert!(loss.is_finite() && loss >= 0.0, "{loss_target:?}: {loss}");
    }
}

#[test]
fn test_conditional_training_with_mask() {
    let device = Default::default();
    let mut rng = NoiseGenerator::seeded(2);

    let model = ResidualDiffusionConfig::new(8)
        .with_num_timesteps(20)
        .with_condition(true)
        .with_input_condition(true)
        .init::<TestBackend, _>(ScaledDenoiser::new(3), &device)
        .unwrap();
    assert_eq!(model.sum_scale(), 0.01);

    let target = uniform_images(&mut rng, [2, 3, 8, 8]);
    let input = uniform_images(&mut rng, [2, 3, 8, 8]);
    let mask = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);

    let batch = TrainingBatch::conditional(target.clone(), Conditioning::new(input.clone()).with_mask(mask));
    let loss = scalar(model.forward(batch, &mut rng).unwrap());
    assert!(loss.is_finite() && loss >= 0.0);

    // The mask is part of the denoiser input, so leaving it out is an error
    let batch = TrainingBatch::conditional(target, Conditioning::new(input));
    let err = model.forward(batch, &mut rng).unwrap_err();
    assert!(matches!(err, DiffusionError::MissingCondition(_)));
}

#[test]
fn test_self_conditioning_during_training_is_random() {
    let device = Default::default();
    let denoiser = ScaledDenoiser::new(3).with_self_condition();
    let model = ResidualDiffusionConfig::new(8)
        .with_num_timesteps(10)
        .init::<TestBackend, _>(&denoiser, &device)
        .unwrap();
    assert!(model.mode().self_condition);

    let mut rng = NoiseGenerator::seeded(3);
    let target = uniform_images(&mut rng, [1, 3, 4, 4]);
    for _ in 0..32 {
        model
            .forward(TrainingBatch::generation(target.clone()), &mut rng)
            .unwrap();
    }

    // Each step is either one plain call, or an estimate followed by a
    // self-conditioned call
    let seen = denoiser.self_cond_seen.borrow();
    let conditioned = seen.iter().filter(|&&s| s).count();
    assert_eq!(seen.len(), 32 + conditioned);
    assert!(conditioned > 0 && conditioned < 32, "{conditioned}");
}

#[test]
fn test_mask_normalization_follows_mode() {
    let device = Default::default();
    let cond = Conditioning::new(Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device))
        .with_mask(Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device));

    let raw_mask = ResidualDiffusionConfig::new(2)
        .with_num_timesteps(5)
        .with_condition(true)
        .with_input_condition(true)
        .with_input_condition_mask(true)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let normalized = raw_mask.normalize_condition(cond.clone());
    assert!(values(normalized.input).iter().all(|&v| v == 1.0));
    assert!(values(normalized.mask.unwrap()).iter().all(|&v| v == 0.0));

    let scaled_mask = ResidualDiffusionConfig::new(2)
        .with_num_timesteps(5)
        .with_condition(true)
        .with_input_condition(true)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let normalized = scaled_mask.normalize_condition(cond);
    assert!(values(normalized.mask.unwrap()).iter().all(|&v| v == -1.0));
}

// ============================================================================
// Sampling
// ============================================================================

#[test]
fn test_conditional_strided_sampling_is_reproducible() {
    let device = Default::default();
    let model = ResidualDiffusionConfig::new(16)
        .with_num_timesteps(100)
        .with_sampling_timesteps(10)
        .with_condition(true)
        .with_ddim_sampling_eta(1.0)
        .with_sum_scale(0.01)
        .init::<TestBackend, _>(ScaledDenoiser::new(3), &device)
        .unwrap();

    // eta is forced to zero for restoration
    assert_eq!(
        model.sampler(),
        ReverseSampler::Strided(StridedSampler {
            sampling_timesteps: 10,
            eta: 0.0
        })
    );

    let input = uniform_images(&mut NoiseGenerator::seeded(5), [2, 3, 16, 16]);

    let a = model
        .sample(Some(Conditioning::new(input.clone())), 2, false, &mut NoiseGenerator::seeded(7))
        .unwrap();
    let b = model
        .sample(Some(Conditioning::new(input)), 2, false, &mut NoiseGenerator::seeded(7))
        .unwrap();

    assert!(a.input_add_noise.is_some());
    assert_eq!(a.image.dims(), [2, 3, 16, 16]);

    let a = values(a.image);
    assert_eq!(a, values(b.image));
    assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_stochastic_sampling_depends_on_seed() {
    let device = Default::default();
    let model = ResidualDiffusionConfig::new(8)
        .with_num_timesteps(100)
        .with_sampling_timesteps(10)
        .with_ddim_sampling_eta(1.0)
        .init::<TestBackend, _>(ScaledDenoiser::new(3), &device)
        .unwrap();

    let a = model.sample(None, 2, false, &mut NoiseGenerator::seeded(1)).unwrap();
    let b = model.sample(None, 2, false, &mut NoiseGenerator::seeded(2)).unwrap();
    assert_ne!(values(a.image), values(b.image));
}

#[test]
fn test_frames_layout() {
    let device = Default::default();

    let generation = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(6)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let frames = generation
        .sample(None, 1, true, &mut NoiseGenerator::seeded(0))
        .unwrap()
        .into_frames();
    assert_eq!(frames.len(), 6);

    let frames = generation
        .sample(None, 1, false, &mut NoiseGenerator::seeded(0))
        .unwrap()
        .into_frames();
    assert_eq!(frames.len(), 1);

    let restoration = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(12)
        .with_sampling_timesteps(3)
        .with_condition(true)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let input = Tensor::<TestBackend, 4>::full([1, 1, 4, 4], 0.5, &device);
    let output = restoration
        .sample(Some(Conditioning::new(input)), 1, true, &mut NoiseGenerator::seeded(0))
        .unwrap();
    let last_step = values(output.steps[2].clone());
    let frames = output.into_frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(values(frames[3].clone()), last_step);
}

#[test]
fn test_sampling_feeds_back_start_estimate() {
    let device = Default::default();
    let denoiser = ScaledDenoiser::new(1).with_self_condition();
    let model = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(5)
        .init::<TestBackend, _>(&denoiser, &device)
        .unwrap();

    model.sample(None, 1, false, &mut NoiseGenerator::seeded(0)).unwrap();
    assert_eq!(*denoiser.self_cond_seen.borrow(), vec![false, true, true, true, true]);
}

#[test]
fn test_explicit_sampler_override() {
    let device = Default::default();
    let model = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(20)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    assert!(matches!(model.sampler(), ReverseSampler::Ancestral(_)));

    let strided = StridedSampler::new(20, 4, 0.0).unwrap();
    let output = model
        .sample_with(&strided, None, 3, true, &mut NoiseGenerator::seeded(0))
        .unwrap();
    assert_eq!(output.steps.len(), 4);
    assert_eq!(output.image.dims(), [3, 1, 4, 4]);
}

// ============================================================================
// Configuration errors
// ============================================================================

#[test]
fn test_configuration_errors() {
    let device: <TestBackend as Backend>::Device = Default::default();
    let init = |config: ResidualDiffusionConfig, denoiser: ScaledDenoiser| {
        config.init::<TestBackend, _>(denoiser, &device).map(|_| ())
    };

    assert_eq!(
        init(ResidualDiffusionConfig::new(8).with_loss_type("l3"), ScaledDenoiser::new(3)),
        Err(DiffusionError::InvalidLossType("l3".to_string()))
    );
    assert_eq!(
        init(
            ResidualDiffusionConfig::new(8)
                .with_num_timesteps(10)
                .with_sampling_timesteps(11),
            ScaledDenoiser::new(3)
        ),
        Err(DiffusionError::SamplingTimesteps { sampling: 11, total: 10 })
    );
    assert_eq!(
        init(ResidualDiffusionConfig::new(8).with_num_timesteps(0), ScaledDenoiser::new(3)),
        Err(DiffusionError::InvalidTimesteps(0))
    );
    assert_eq!(
        init(ResidualDiffusionConfig::new(8).with_ddim_sampling_eta(-0.1), ScaledDenoiser::new(3)),
        Err(DiffusionError::InvalidEta(-0.1))
    );
    assert_eq!(
        init(ResidualDiffusionConfig::new(8).with_sum_scale(-1.0), ScaledDenoiser::new(3)),
        Err(DiffusionError::InvalidSumScale(-1.0))
    );
    assert_eq!(
        init(
            ResidualDiffusionConfig::new(8).with_input_condition(true),
            ScaledDenoiser::new(3)
        ),
        Err(DiffusionError::MaskWithoutCondition)
    );

    let mut mismatched = ScaledDenoiser::new(3);
    mismatched.out_channels = 6;
    assert_eq!(
        init(ResidualDiffusionConfig::new(8), mismatched),
        Err(DiffusionError::ChannelMismatch {
            channels: 3,
            out_channels: 6
        })
    );
}

#[test]
fn test_sampling_conditioning_errors() {
    let device = Default::default();
    let mut rng = NoiseGenerator::seeded(0);
    let input = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);

    let restoration = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(5)
        .with_condition(true)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let err = restoration.sample(None, 1, false, &mut rng).unwrap_err();
    assert!(matches!(err, DiffusionError::MissingCondition(_)));

    let generation = ResidualDiffusionConfig::new(4)
        .with_num_timesteps(5)
        .init::<TestBackend, _>(ScaledDenoiser::new(1), &device)
        .unwrap();
    let err = generation
        .sample(Some(Conditioning::new(input)), 1, false, &mut rng)
        .unwrap_err();
    assert_eq!(err, DiffusionError::UnexpectedCondition);
}
