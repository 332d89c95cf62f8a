//! Bring the common reading API into scope
pub use crate::config::ReaderConfig;
pub use crate::io::{GatherStats, SourceError, SourceKind, SpectraSource};
pub use crate::mass_error::Tolerance;
pub use crate::spectrum::Spectrum;
