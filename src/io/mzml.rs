//! Read the MS/MS spectra of PSI-MS mzML and indexedmzML documents.
//!
//! Only the parts of the document needed to search a spectrum are decoded:
//! the MS level, scan start time, the first selected ion and the m/z and
//! intensity arrays. Everything else is skipped.

mod reader;

pub use reader::{MzMLError, MzMLParser, MZML_MAX_CHARGE};

use crate::io::leaf::LeafSource;

/// A [`SpectraSource`](crate::io::SpectraSource) over an mzML file or stream
pub type MzMLSource = LeafSource<MzMLParser>;

/// Whether the leading bytes of a document look like mzML
pub fn is_mzml(buf: &[u8]) -> bool {
    let needle = b"<mzML";
    let indexed = b"<indexedmzML";
    buf.windows(needle.len()).any(|window| window == needle)
        || buf.windows(indexed.len()).any(|window| window == indexed)
}
