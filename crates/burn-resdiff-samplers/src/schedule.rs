//! Residual diffusion schedule
//!
//! The forward process moves a clean image `x_0` towards a degraded input
//! `x_in` while accumulating Gaussian noise:
//!
//! ```text
//! x_t = x_0 + ᾱ_t · (x_in − x_0) + β̄_t · ε
//! ```
//!
//! `ᾱ_t` (`alphas_cumsum`) is the cumulative residual weight and `β̄_t²`
//! (`betas2_cumsum`) the cumulative noise variance. This module derives both,
//! together with the closed-form posterior coefficients, once per model.

use burn::prelude::*;
use burn_resdiff_core::DiffusionError;

use crate::coefficients::{clipped_cumsum, gen_coefficients, shifted_prev, CoefficientShape};

/// Replacement for `1 − ᾱ` at the last step, where it is exactly zero
pub const FINAL_STEP_EPSILON: f64 = 1e-6;

/// Floor applied before taking the log of the posterior variance
pub const LOG_VARIANCE_FLOOR: f64 = 1e-20;

/// Host-side schedule values, one entry per timestep
///
/// Computed in `f64`. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCoefficients {
    /// Per-step residual weight α_t (decreasing, sums to 1)
    pub alphas: Vec<f64>,
    /// ᾱ_t, clipped to [0, 1]
    pub alphas_cumsum: Vec<f64>,
    /// 1 − ᾱ_t, with the last entry replaced by [`FINAL_STEP_EPSILON`]
    pub one_minus_alphas_cumsum: Vec<f64>,
    /// Per-step noise variance β_t² (increasing, sums to `sum_scale`)
    pub betas2: Vec<f64>,
    /// β_t
    pub betas: Vec<f64>,
    /// β̄_t², clipped to [0, 1]
    pub betas2_cumsum: Vec<f64>,
    /// β̄_t
    pub betas_cumsum: Vec<f64>,
    /// Weight of x_t in the posterior mean
    pub posterior_mean_coef1: Vec<f64>,
    /// Weight of the residual in the posterior mean
    pub posterior_mean_coef2: Vec<f64>,
    /// Weight of x_0 in the posterior mean
    pub posterior_mean_coef3: Vec<f64>,
    /// Posterior variance β_t² β̄_{t−1}² / β̄_t²
    pub posterior_variance: Vec<f64>,
    /// ln(max(posterior_variance, 1e-20))
    pub posterior_log_variance_clipped: Vec<f64>,
}

impl ScheduleCoefficients {
    /// Derives every coefficient for `num_timesteps` steps
    ///
    /// At step 0 the posterior degenerates to the predicted start image:
    /// `coef1 = coef2 = 0`, `coef3 = 1`, zero variance.
    pub fn new(num_timesteps: usize, sum_scale: f64) -> Result<Self, DiffusionError> {
        if num_timesteps == 0 {
            return Err(DiffusionError::InvalidTimesteps(num_timesteps));
        }
        if !(sum_scale.is_finite() && sum_scale > 0.0) {
            return Err(DiffusionError::InvalidSumScale(sum_scale));
        }

        let alphas = gen_coefficients(num_timesteps, CoefficientShape::Decreased, 1.0);
        let alphas_cumsum = clipped_cumsum(&alphas);
        let alphas_cumsum_prev = shifted_prev(&alphas_cumsum, 1.0);

        let betas2 = gen_coefficients(num_timesteps, CoefficientShape::Increased, sum_scale);
        let betas = betas2.iter().map(|b| b.sqrt()).collect();
        let betas2_cumsum = clipped_cumsum(&betas2);
        let betas_cumsum = betas2_cumsum.iter().map(|b| b.sqrt()).collect();
        let betas2_cumsum_prev = shifted_prev(&betas2_cumsum, 1.0);

        let mut one_minus_alphas_cumsum: Vec<f64> = alphas_cumsum.iter().map(|a| 1.0 - a).collect();

        let mut coef1 = Vec::with_capacity(num_timesteps);
        let mut coef2 = Vec::with_capacity(num_timesteps);
        let mut coef3 = Vec::with_capacity(num_timesteps);
        let mut variance = Vec::with_capacity(num_timesteps);
        for t in 0..num_timesteps {
            let b2c = betas2_cumsum[t];
            let b2c_prev = betas2_cumsum_prev[t];
            coef1.push(b2c_prev / b2c);
            coef2.push((betas2[t] * alphas_cumsum_prev[t] - b2c_prev * alphas[t]) / b2c);
            coef3.push(betas2[t] / b2c);
            variance.push(betas2[t] * b2c_prev / b2c);
        }

        coef1[0] = 0.0;
        coef2[0] = 0.0;
        coef3[0] = 1.0;
        variance[0] = 0.0;
        one_minus_alphas_cumsum[num_timesteps - 1] = FINAL_STEP_EPSILON;

        let log_variance = variance
            .iter()
            .map(|v: &f64| v.max(LOG_VARIANCE_FLOOR).ln())
            .collect();

        Ok(Self {
            alphas,
            alphas_cumsum,
            one_minus_alphas_cumsum,
            betas2,
            betas,
            betas2_cumsum,
            betas_cumsum,
            posterior_mean_coef1: coef1,
            posterior_mean_coef2: coef2,
            posterior_mean_coef3: coef3,
            posterior_variance: variance,
            posterior_log_variance_clipped: log_variance,
        })
    }

    /// Number of timesteps
    pub fn len(&self) -> usize {
        self.alphas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas.is_empty()
    }
}

/// Device copies of the coefficients gathered per sample
#[derive(Debug, Clone)]
pub struct ScheduleTensors<B: Backend> {
    pub alphas: Tensor<B, 1>,
    pub alphas_cumsum: Tensor<B, 1>,
    pub one_minus_alphas_cumsum: Tensor<B, 1>,
    pub betas2: Tensor<B, 1>,
    pub betas_cumsum: Tensor<B, 1>,
    pub posterior_mean_coef1: Tensor<B, 1>,
    pub posterior_mean_coef2: Tensor<B, 1>,
    pub posterior_mean_coef3: Tensor<B, 1>,
    pub posterior_variance: Tensor<B, 1>,
    pub posterior_log_variance_clipped: Tensor<B, 1>,
}

impl<B: Backend> ScheduleTensors<B> {
    fn new(coefficients: &ScheduleCoefficients, device: &B::Device) -> Self {
        let upload = |values: &[f64]| {
            let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            Tensor::<B, 1>::from_data(TensorData::new(data, [values.len()]), device)
        };

        Self {
            alphas: upload(&coefficients.alphas),
            alphas_cumsum: upload(&coefficients.alphas_cumsum),
            one_minus_alphas_cumsum: upload(&coefficients.one_minus_alphas_cumsum),
            betas2: upload(&coefficients.betas2),
            betas_cumsum: upload(&coefficients.betas_cumsum),
            posterior_mean_coef1: upload(&coefficients.posterior_mean_coef1),
            posterior_mean_coef2: upload(&coefficients.posterior_mean_coef2),
            posterior_mean_coef3: upload(&coefficients.posterior_mean_coef3),
            posterior_variance: upload(&coefficients.posterior_variance),
            posterior_log_variance_clipped: upload(&coefficients.posterior_log_variance_clipped),
        }
    }
}

/// Immutable schedule shared by training and sampling
#[derive(Debug, Clone)]
pub struct ResidualSchedule<B: Backend> {
    coefficients: ScheduleCoefficients,
    tensors: ScheduleTensors<B>,
    sum_scale: f64,
    device: B::Device,
}

impl<B: Backend> ResidualSchedule<B> {
    /// Builds the schedule for `num_timesteps` steps and noise budget `sum_scale`
    pub fn new(num_timesteps: usize, sum_scale: f64, device: &B::Device) -> Result<Self, DiffusionError> {
        let coefficients = ScheduleCoefficients::new(num_timesteps, sum_scale)?;
        let tensors = ScheduleTensors::new(&coefficients, device);

        log::debug!(
            "residual schedule: {num_timesteps} steps, sum_scale={sum_scale}, final betas_cumsum={:.6}",
            coefficients.betas_cumsum[num_timesteps - 1]
        );

        Ok(Self {
            coefficients,
            tensors,
            sum_scale,
            device: device.clone(),
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.coefficients.len()
    }

    /// Total noise variance budget
    pub fn sum_scale(&self) -> f64 {
        self.sum_scale
    }

    pub fn coefficients(&self) -> &ScheduleCoefficients {
        &self.coefficients
    }

    pub fn tensors(&self) -> &ScheduleTensors<B> {
        &self.tensors
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// Gathers `a[t]` per batch element, shaped `[batch, 1, 1, 1]` for broadcasting
pub fn extract<B: Backend>(a: &Tensor<B, 1>, t: Tensor<B, 1, Int>) -> Tensor<B, 4> {
    let [batch] = t.dims();
    a.clone().select(0, t).reshape([batch, 1, 1, 1])
}
