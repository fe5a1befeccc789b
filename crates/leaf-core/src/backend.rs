//! Backend selection for the Burn framework.
//!
//! The tensor backend is fixed at compile time: `NdArray` on the CPU by
//! default, `Wgpu` when the `wgpu` feature is enabled. At runtime the host is
//! probed for an accelerator so the run log states which path is in use. A
//! missing accelerator is never an error.

use std::sync::{Once, OnceLock};

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(feature = "wgpu")]
pub type ComputeBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type ComputeBackend = burn::backend::NdArray;

/// Backend used for training, with automatic differentiation.
pub type TrainingBackend = Autodiff<ComputeBackend>;

/// Device type used for logging the selected execution path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceKind {
    /// CPU backend
    Cpu,
    /// GPU backend
    Gpu(usize),
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

static SELECTED: OnceLock<DeviceKind> = OnceLock::new();
static FALLBACK_NOTICE: Once = Once::new();

/// Selects the execution path for this process and returns the burn device.
///
/// The probe runs once; later calls return the cached choice. When no usable
/// accelerator exists, one informational line is logged and the CPU path is
/// used.
pub fn select_device() -> (DeviceKind, <ComputeBackend as Backend>::Device) {
    let kind = *SELECTED.get_or_init(|| {
        let gpu_present = is_gpu_available();
        if gpu_present && cfg!(feature = "wgpu") {
            DeviceKind::Gpu(0)
        } else {
            FALLBACK_NOTICE.call_once(|| {
                if gpu_present {
                    info!("GPU detected but this build has no GPU backend, using CPU");
                } else {
                    info!("No accelerated device available, using CPU");
                }
            });
            DeviceKind::Cpu
        }
    });

    (kind, Default::default())
}

/// Check if any GPU acceleration is available
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu() || has_amd_gpu()
}

/// Check for NVIDIA GPU (CUDA)
fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

/// Check for AMD GPU (ROCm)
fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(DeviceKind::Cpu.to_string(), "CPU");
        assert_eq!(DeviceKind::Gpu(1).to_string(), "GPU:1");
    }

    #[test]
    fn test_select_device_is_stable() {
        let (first, _) = select_device();
        let (second, _) = select_device();
        assert_eq!(first, second);
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_cpu_build_always_selects_cpu() {
        let (kind, _) = select_device();
        assert_eq!(kind, DeviceKind::Cpu);
    }
}
