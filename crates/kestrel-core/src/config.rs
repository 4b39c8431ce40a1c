use std::env;
use std::sync::{OnceLock, RwLock};

use crate::device::Device;
use crate::error::{Error, Result};

// Process-wide device preference
//
// New buffers record the preferred device at creation time; the preference
// only matters for buffers that are not yet fresh anywhere (see
// `device::choose_device`). It starts from `KESTREL_DEVICE` (`cpu`, `gpu`,
// `gpu:N`) and can be changed with `set_default_device`. An unrecognized
// value is kept and reported by every `default_device` call until it is
// replaced.

/// The configured device, or the setting that failed to parse.
type Preference = std::result::Result<Device, String>;

static DEFAULT_DEVICE: OnceLock<RwLock<Preference>> = OnceLock::new();

/// Interpret a `KESTREL_DEVICE` value; unset or blank means the CPU.
pub fn parse_device_setting(value: Option<&str>) -> Result<Device> {
    match value.map(str::trim) {
        None | Some("") => Ok(Device::Cpu),
        Some(value) => Device::parse(value).ok_or_else(|| Error::InvalidDevice {
            value: value.to_string(),
        }),
    }
}

fn preference() -> &'static RwLock<Preference> {
    DEFAULT_DEVICE.get_or_init(|| {
        let value = env::var("KESTREL_DEVICE").ok();
        let device = parse_device_setting(value.as_deref()).map_err(|_| value.unwrap_or_default());
        RwLock::new(device)
    })
}

/// Whether this build can drive a GPU at all.
pub fn gpu_available() -> bool {
    cfg!(feature = "cuda")
}

/// Fail unless `device` is usable in this build.
pub fn check_device(device: Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        Device::Gpu(_) if gpu_available() => Ok(()),
        Device::Gpu(_) => Err(Error::gpu_unavailable(device)),
    }
}

/// The device new buffers prefer. Errors if the configured device is a GPU
/// and this build has no GPU support.
pub fn default_device() -> Result<Device> {
    let device = preference()
        .read()
        .map_err(|_| Error::msg("device preference lock poisoned"))?
        .clone()
        .map_err(|value| Error::InvalidDevice { value })?;
    check_device(device)?;
    Ok(device)
}

/// Change the process-wide preferred device.
pub fn set_default_device(device: Device) -> Result<()> {
    check_device(device)?;
    let mut guard = preference()
        .write()
        .map_err(|_| Error::msg("device preference lock poisoned"))?;
    *guard = Ok(device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_allowed() {
        assert!(check_device(Device::Cpu).is_ok());
        assert!(set_default_device(Device::Cpu).is_ok());
        assert_eq!(default_device().unwrap(), Device::Cpu);
    }

    #[test]
    fn test_device_setting_is_parsed_strictly() {
        assert_eq!(parse_device_setting(None).unwrap(), Device::Cpu);
        assert_eq!(parse_device_setting(Some("  ")).unwrap(), Device::Cpu);
        assert_eq!(parse_device_setting(Some("GPU:2")).unwrap(), Device::Gpu(2));
        for bad in ["tpu", "gpu:x", "gpu:"] {
            assert!(matches!(
                parse_device_setting(Some(bad)),
                Err(Error::InvalidDevice { .. })
            ));
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_gpu_is_configuration_error_without_cuda() {
        let err = set_default_device(Device::Gpu(0)).unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
        assert_eq!(default_device().unwrap(), Device::Cpu);
    }
}
