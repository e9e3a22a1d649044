//! Backend selection for burn-resdiff
//!
//! Enable one backend via feature flags; the first enabled one in the order
//! `ndarray`, `tch`, `wgpu`, `cuda` becomes [`DefaultBackend`]:
//!
//! - `ndarray`: CPU backend using ndarray
//! - `tch`: PyTorch backend via libtorch
//! - `wgpu`: WebGPU backend
//! - `cuda`: Native CUDA backend
//!
//! ```ignore
//! use burn_resdiff::backends::{default_device, DefaultBackend};
//!
//! let device = default_device();
//! let model = config.init::<DefaultBackend, _>(denoiser, &device)?;
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "tch")]
pub use burn_tch::{LibTorch, LibTorchDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

#[cfg(feature = "ndarray")]
mod selected {
    pub type Backend = super::NdArray<f32>;

    pub fn device() -> super::NdArrayDevice {
        super::NdArrayDevice::default()
    }
}

#[cfg(all(feature = "tch", not(feature = "ndarray")))]
mod selected {
    pub type Backend = super::LibTorch<f32>;

    pub fn device() -> super::LibTorchDevice {
        super::LibTorchDevice::default()
    }
}

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
mod selected {
    pub type Backend = super::Wgpu;

    pub fn device() -> super::WgpuDevice {
        super::WgpuDevice::default()
    }
}

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
mod selected {
    pub type Backend = super::Cuda;

    pub fn device() -> super::CudaDevice {
        super::CudaDevice::default()
    }
}

/// Backend picked by the enabled features
#[cfg(any(feature = "ndarray", feature = "tch", feature = "wgpu", feature = "cuda"))]
pub type DefaultBackend = selected::Backend;

/// Default device of [`DefaultBackend`]
#[cfg(any(feature = "ndarray", feature = "tch", feature = "wgpu", feature = "cuda"))]
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    selected::device()
}
