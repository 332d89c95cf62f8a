use std::cmp;
use std::fmt;

/// A single centroided fragment peak
#[derive(Default, Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpectraPeak {
    pub mz: f64,
    pub intensity: f64,
}

impl SpectraPeak {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self { mz, intensity }
    }
}

impl fmt::Display for SpectraPeak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SpectraPeak({}, {})", self.mz, self.intensity)
    }
}

impl cmp::PartialOrd<SpectraPeak> for SpectraPeak {
    fn partial_cmp(&self, other: &SpectraPeak) -> Option<cmp::Ordering> {
        self.mz.partial_cmp(&other.mz)
    }
}

impl cmp::PartialEq<SpectraPeak> for SpectraPeak {
    fn eq(&self, other: &SpectraPeak) -> bool {
        if (self.mz - other.mz).abs() > 1e-3 || (self.intensity - other.intensity).abs() > 1e-3 {
            return false;
        }
        true
    }
}

impl From<(f64, f64)> for SpectraPeak {
    fn from((mz, intensity): (f64, f64)) -> Self {
        Self::new(mz, intensity)
    }
}
