use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    /// GPU by ordinal. Accepted by the config layer so a run file naming a
    /// GPU fails in [`ExecutionContext::new`] instead of silently falling
    /// back; no GPU backend is built.
    Cuda(usize),
}

/// Where a run executes and how its randomness is seeded. Owned by the
/// caller for the duration of one run and handed to the actor explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    device: Device,
    seed: u64,
}

impl ExecutionContext {
    pub fn new(device: Device, seed: u64) -> Result<Self> {
        match device {
            Device::Cpu => Ok(Self { device, seed }),
            Device::Cuda(index) => Err(Error::Unsupported(format!(
                "device cuda:{index}; only the CPU backend is available"
            ))),
        }
    }

    pub fn cpu(seed: u64) -> Self {
        Self {
            device: Device::Cpu,
            seed,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fresh generator seeded from the context.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn gpu_devices_are_rejected() {
        assert!(matches!(
            ExecutionContext::new(Device::Cuda(0), 1),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn configured_gpu_fails_at_construction() {
        let device: Device = serde_json::from_str(r#"{"cuda": 1}"#).unwrap();
        assert_eq!(device, Device::Cuda(1));
        let err = ExecutionContext::new(device, 7).unwrap_err();
        assert!(err.to_string().contains("cuda:1"), "{err}");
        let cpu: Device = serde_json::from_str(r#""cpu""#).unwrap();
        assert_eq!(ExecutionContext::new(cpu, 7).unwrap().device(), Device::Cpu);
    }

    #[test]
    fn rng_is_reproducible() {
        let ctx = ExecutionContext::new(Device::Cpu, 42).unwrap();
        let a: u64 = ctx.rng().gen();
        let b: u64 = ctx.rng().gen();
        assert_eq!(a, b);
    }
}
