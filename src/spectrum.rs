pub mod spectrum;

pub use crate::spectrum::spectrum::Spectrum;
