//! Residual Diffusion Schedule and Samplers
//!
//! The numerical core of residual diffusion: a forward process that shifts a
//! clean image towards a degraded input while adding noise, its closed-form
//! posterior, and two ways of walking the reverse chain.
//!
//! # Modules
//!
//! - [`coefficients`] - Increasing, decreasing and flat weight sequences
//! - [`schedule`] - [`ResidualSchedule`]: cumulative sums and posterior coefficients
//! - [`forward`] - `q_sample`, the closed-form forward process
//! - [`posterior`] - Cross-derivations, `q_posterior` and [`PosteriorEngine`]
//! - [`sampler`] - The [`Sampler`] trait and [`SampleOutput`]
//!
//! ## Samplers
//!
//! - [`AncestralSampler`] - One denoiser call per timestep
//! - [`StridedSampler`] - DDIM-style reduced-step sampling with `eta`

pub mod ancestral;
pub mod coefficients;
pub mod forward;
pub mod posterior;
pub mod sampler;
pub mod schedule;
pub mod strided;

pub use ancestral::AncestralSampler;
pub use coefficients::{gen_coefficients, CoefficientShape};
pub use posterior::{ModelPrediction, Posterior, PosteriorEngine};
pub use sampler::{initial_state, SampleOutput, Sampler, Trajectory};
pub use schedule::{extract, ResidualSchedule, ScheduleCoefficients, ScheduleTensors};
pub use strided::{strided_timesteps, ReverseSampler, StridedSampler};
