//! Seeded randomness for the forward process, the samplers and training
//!
//! All Gaussian draws go through a [`NoiseGenerator`] owned by the caller,
//! so a fixed seed reproduces a run bit for bit on any backend.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Source of standard Gaussian noise and uniform timesteps
#[derive(Debug, Clone)]
pub struct NoiseGenerator {
    rng: StdRng,
}

impl NoiseGenerator {
    /// Deterministic generator
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generator seeded from the operating system
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Standard normal tensor of the given shape
    pub fn normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = (0..numel)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Standard normal tensor shaped like `x`, on the same device
    pub fn normal_like<B: Backend, const D: usize>(&mut self, x: &Tensor<B, D>) -> Tensor<B, D> {
        self.normal(x.dims(), &x.device())
    }

    /// Uniform timesteps in `0..num_timesteps`, one per batch element
    pub fn timesteps<B: Backend>(
        &mut self,
        batch_size: usize,
        num_timesteps: usize,
        device: &B::Device,
    ) -> Tensor<B, 1, Int> {
        let values: Vec<i64> = (0..batch_size)
            .map(|_| self.rng.random_range(0..num_timesteps) as i64)
            .collect();
        Tensor::from_data(TensorData::new(values, [batch_size]), device)
    }

    /// `true` with probability `p`
    pub fn coin(&mut self, p: f64) -> bool {
        self.rng.random_bool(p)
    }
}

impl Default for NoiseGenerator {
    fn default() -> Self {
        Self::from_os_rng()
    }
}
