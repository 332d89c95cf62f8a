//! Reading spectra from peak list files and from the compressed files,
//! archives, directories and manifests they are shipped in.
//!
//! Every reader implements [`SpectraSource`], and [`open`] picks and nests
//! them for whatever path it is given.

mod infer_format;
pub(crate) mod leaf;
pub(crate) mod lookahead;
pub(crate) mod traits;

pub mod apl;
pub mod archive;
pub mod compression;
pub mod container;
pub mod mgf;
#[cfg(feature = "mzml")]
pub mod mzml;

pub use crate::io::infer_format::{
    infer_from_name, infer_from_path, infer_from_stream, is_junk_name, open, open_stream,
    SpectraFormat,
};

pub use crate::io::apl::{APLError, APLParser, APLSource};
pub use crate::io::archive::{ArchiveSource, EntryMeta, MAX_ARCHIVE_DEPTH};
pub use crate::io::container::ContainerSource;
pub use crate::io::leaf::{LeafSource, RecordParser};
pub use crate::io::mgf::{MGFError, MGFParser, MGFSource};
#[cfg(feature = "mzml")]
pub use crate::io::mzml::{MzMLError, MzMLParser, MzMLSource};

pub use crate::io::traits::{GatherStats, OpenStage, SourceError, SourceKind, SpectraSource};
