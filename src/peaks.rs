pub mod peak;
pub mod peak_set;

pub use crate::peaks::peak::SpectraPeak;
pub use crate::peaks::peak_set::PeakSet;
