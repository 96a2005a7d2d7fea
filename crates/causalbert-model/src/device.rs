//! Compute device selection: CUDA > Metal > CPU fallback.

use candle_core::Device;

/// Select the compute device for training and inference.
///
/// With `force_cpu` the accelerators are skipped entirely. Otherwise CUDA is
/// tried first (when compiled with the `cuda` feature), then Metal (with the
/// `metal` feature), then the CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        tracing::info!("CPU device requested");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!(ordinal = 0, "Using CUDA device");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "CUDA unavailable, falling back"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!(ordinal = 0, "Using Metal device");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "Metal unavailable, falling back"),
        }
    }

    Device::Cpu
}

/// Short human-readable device name for log lines.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_cpu() {
        let device = select_device(true);
        assert!(device.is_cpu());
        assert_eq!(device_name(&device), "cpu");
    }
}
