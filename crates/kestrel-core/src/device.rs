use std::fmt;

// Device selection
//
// Every memory buffer may hold a CPU copy, a GPU copy, or both. Before an
// expression runs, the freshness bits of all its participants are collected
// and handed to `choose_device`, a pure function, so the policy can be
// tested without any buffers:
//
//   - if any participant's freshest copy is on a GPU, compute on that GPU
//     (the first such participant wins the ordinal);
//   - otherwise, if nothing is fresh anywhere yet, use the first
//     participant's preferred device;
//   - otherwise compute on the CPU.

/// A compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Gpu(usize),
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    /// Parse `cpu`, `gpu` (ordinal 0) or `gpu:N`.
    pub fn parse(s: &str) -> Option<Device> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cpu" => Some(Device::Cpu),
            "gpu" | "cuda" => Some(Device::Gpu(0)),
            other => {
                let ordinal = other
                    .strip_prefix("gpu:")
                    .or_else(|| other.strip_prefix("cuda:"))?;
                ordinal.parse().ok().map(Device::Gpu)
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(ordinal) => write!(f, "gpu:{}", ordinal),
        }
    }
}

/// Snapshot of one buffer's freshness bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub cpu_fresh: bool,
    /// The ordinal of the GPU holding a fresh copy, if any.
    pub gpu_fresh: Option<usize>,
    /// Where the buffer wants to live when it has no fresh copy yet.
    pub preferred: Device,
}

impl Freshness {
    pub fn is_fresh_anywhere(&self) -> bool {
        self.cpu_fresh || self.gpu_fresh.is_some()
    }
}

/// Pick the device an expression over these participants should run on.
pub fn choose_device(participants: &[Freshness]) -> Device {
    if let Some(ordinal) = participants.iter().find_map(|f| f.gpu_fresh) {
        return Device::Gpu(ordinal);
    }
    if participants.iter().all(|f| !f.is_fresh_anywhere()) {
        if let Some(first) = participants.first() {
            return first.preferred;
        }
    }
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Freshness {
        Freshness {
            cpu_fresh: true,
            gpu_fresh: None,
            preferred: Device::Cpu,
        }
    }

    fn gpu(ordinal: usize) -> Freshness {
        Freshness {
            cpu_fresh: false,
            gpu_fresh: Some(ordinal),
            preferred: Device::Cpu,
        }
    }

    fn unallocated(preferred: Device) -> Freshness {
        Freshness {
            cpu_fresh: false,
            gpu_fresh: None,
            preferred,
        }
    }

    #[test]
    fn test_any_gpu_fresh_wins() {
        assert_eq!(choose_device(&[cpu(), cpu(), gpu(1)]), Device::Gpu(1));
        assert_eq!(choose_device(&[gpu(0), gpu(1)]), Device::Gpu(0));
    }

    #[test]
    fn test_all_cpu_stays_on_cpu() {
        assert_eq!(choose_device(&[cpu(), cpu()]), Device::Cpu);
        assert_eq!(
            choose_device(&[cpu(), unallocated(Device::Gpu(0))]),
            Device::Cpu
        );
    }

    #[test]
    fn test_nothing_fresh_uses_preference() {
        assert_eq!(
            choose_device(&[unallocated(Device::Gpu(2))]),
            Device::Gpu(2)
        );
        assert_eq!(choose_device(&[]), Device::Cpu);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Device::parse("CPU"), Some(Device::Cpu));
        assert_eq!(Device::parse("gpu"), Some(Device::Gpu(0)));
        assert_eq!(Device::parse("gpu:3"), Some(Device::Gpu(3)));
        assert_eq!(Device::parse("tpu"), None);
        assert_eq!(Device::parse("gpu:x"), None);
    }
}
