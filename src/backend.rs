//! Compute backend selection
//!
//! Training runs on `Autodiff<DefaultBackend>`; evaluation, export and
//! prediction use the plain backend. The choice is made at compile time:
//! feature `cuda` selects the GPU, otherwise NdArray runs on the CPU.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("enable one of the `ndarray`, `cpu` or `cuda` features");

/// Backend for the two training stages
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Backend for evaluation, export and single-image inference
pub type InferenceBackend = DefaultBackend;

/// Device shared by both backends
pub type Device = <DefaultBackend as Backend>::Device;

pub fn default_device() -> Device {
    Device::default()
}

/// Human-readable backend name for banners and logs
pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA (GPU)"
    } else {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name_matches_features() {
        let name = backend_name();
        if cfg!(feature = "cuda") {
            assert!(name.contains("CUDA"));
        } else {
            assert!(name.contains("CPU"));
        }
    }
}
