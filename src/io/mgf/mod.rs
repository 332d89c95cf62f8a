//! Read [MGF](https://www.matrixscience.com/help/data_file_help.html#GEN)-like
//! peak lists, the generic text dialect most search inputs arrive in.
//!
//! Records are bracketed by `BEGIN IONS` / `END IONS` and carry `KEY=value`
//! fields followed by `m/z intensity` peak lines. Run names and scan numbers
//! are recovered from the free text `TITLE=` line, see [`MGFParser`].
mod reader;
mod title;

pub use reader::{MGFError, MGFParser, MGFParserState, MGF_MAX_CHARGE};

use crate::io::leaf::LeafSource;

/// A [`SpectraSource`](crate::io::SpectraSource) over an MGF file or stream
pub type MGFSource = LeafSource<MGFParser>;

pub fn is_mgf(buf: &[u8]) -> bool {
    let needle = b"BEGIN IONS";
    buf.windows(needle.len()).any(|window| window == needle)
}
