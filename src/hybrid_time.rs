use serde::{Deserialize, Serialize};
use std::fmt;

const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid logical timestamp: physical microseconds in the high bits, a
/// logical counter in the low 12 bits. Compares as a plain `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    /// Upper sentinel; no mutation is ever stamped with it.
    pub const MAX: HybridTime = HybridTime(u64::MAX);

    pub const fn new(value: u64) -> Self {
        HybridTime(value)
    }

    pub fn from_micros_and_logical(micros: u64, logical: u64) -> Self {
        HybridTime((micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// The next representable timestamp, saturating at `MAX`.
    pub fn incremented(self) -> Self {
        HybridTime(self.0.saturating_add(1))
    }
}

impl From<u64> for HybridTime {
    fn from(value: u64) -> Self {
        HybridTime(value)
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HybridTime::MIN => write!(f, "HT<min>"),
            HybridTime::MAX => write!(f, "HT<max>"),
            ht => write!(f, "HT{{ physical: {} logical: {} }}", ht.physical_micros(), ht.logical()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_and_logical_parts() {
        let ht = HybridTime::from_micros_and_logical(1_000, 5);
        assert_eq!(ht.physical_micros(), 1_000);
        assert_eq!(ht.logical(), 5);
        assert!(ht < HybridTime::from_micros_and_logical(1_000, 6));
        assert!(ht < HybridTime::from_micros_and_logical(1_001, 0));
    }

    #[test]
    fn test_incremented_saturates() {
        assert_eq!(HybridTime::new(7).incremented(), HybridTime::new(8));
        assert_eq!(HybridTime::MAX.incremented(), HybridTime::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(HybridTime::MIN.to_string(), "HT<min>");
        assert_eq!(
            HybridTime::from_micros_and_logical(3, 1).to_string(),
            "HT{ physical: 3 logical: 1 }"
        );
    }
}
