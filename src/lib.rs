//! `msaccess` gives uniform, streaming access to MS/MS peak lists.
//!
//! MGF, MaxQuant APL and mzML files are read one [`Spectrum`] at a time
//! whether they sit on disk as-is, gzip/zstd/bzip2 compressed, inside zip or
//! tar archives (nested to any reasonable depth), in directories, or listed in
//! `.list`/`.msmlist` manifests. Each emitted spectrum records the trail of
//! sources it was read through.
//!
//! ```no_run
//! use msaccess::prelude::*;
//!
//! let mut source = msaccess::open("run.mgf.gz", Tolerance::Da(0.02), 2, ReaderConfig::default())?;
//! let stats = source.gather_data(4)?;
//! println!("{} spectra up to {:.2} Da", stats.spectra_count, stats.max_precursor_mass);
//! for spectrum in source {
//!     let spectrum = spectrum?;
//!     println!("{} {:?}", spectrum.run, spectrum.scan_number);
//! }
//! # Ok::<(), msaccess::SourceError>(())
//! ```
pub mod config;
pub mod io;
pub mod mass_error;
pub mod peaks;
pub mod prelude;
pub mod spectrum;
pub mod utils;

pub use crate::config::{ReaderConfig, SourceSettings};
pub use crate::io::{open, open_stream, GatherStats, OpenStage, SourceError, SourceKind, SpectraSource};
pub use crate::mass_error::{Tolerance, ToleranceParseError};
pub use crate::peaks::{PeakSet, SpectraPeak};
pub use crate::spectrum::Spectrum;
