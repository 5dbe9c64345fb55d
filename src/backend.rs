//! Backend selection
//!
//! NdArray (CPU) is the default; the `cuda` feature switches every
//! training and prediction path to the CUDA backend.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("Enable one backend feature: `ndarray` (default), `cpu` or `cuda`");

/// Autodiff backend used by the trainer
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device handle of the selected backend
pub type Device = <DefaultBackend as Backend>::Device;

/// Default device of the selected backend
pub fn default_device() -> Device {
    Device::default()
}

/// Human-readable backend name for banners and logs
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name_is_set() {
        assert!(!backend_name().is_empty());
    }
}
