//! Resource vectors: worker capacity and per-stage cost.

use std::fmt;

use serde::{Deserialize, Serialize};

/// CPU slots, GPU slots and memory (MiB).
///
/// Integer-valued so that reserve/release arithmetic is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub gpu: u32,
    /// Memory in MiB.
    #[serde(default)]
    pub ram: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        gpu: 0,
        ram: 0,
    };

    pub fn new(cpu: u32, gpu: u32, ram: u64) -> Self {
        Self { cpu, gpu, ram }
    }

    /// Every dimension of `self` is `<=` the same dimension of `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu && self.gpu <= other.gpu && self.ram <= other.ram
    }

    /// `self - other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
            ram: self.ram.checked_sub(other.ram)?,
        })
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_add(other.cpu)?,
            gpu: self.gpu.checked_add(other.gpu)?,
            ram: self.ram.checked_add(other.ram)?,
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} gpu={} ram={}MiB", self.cpu, self.gpu, self.ram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact(Resources::new(1, 1, 8000), true)]
    #[case::smaller(Resources::new(1, 0, 100), true)]
    #[case::too_much_cpu(Resources::new(5, 0, 0), false)]
    #[case::too_much_gpu(Resources::new(0, 2, 0), false)]
    #[case::too_much_ram(Resources::new(0, 0, 8001), false)]
    fn fits_within_checks_every_dimension(#[case] cost: Resources, #[case] expected: bool) {
        let capacity = Resources::new(4, 1, 8000);
        assert_eq!(cost.fits_within(&capacity), expected);
    }

    #[test]
    fn checked_sub_refuses_to_underflow() {
        let a = Resources::new(2, 1, 100);
        assert_eq!(a.checked_sub(&Resources::new(1, 1, 50)), Some(Resources::new(1, 0, 50)));
        assert_eq!(a.checked_sub(&Resources::new(0, 2, 0)), None);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let r: Resources = serde_json::from_str(r#"{"cpu": 2}"#).unwrap();
        assert_eq!(r, Resources::new(2, 0, 0));
    }
}
