use std::{
    fmt::Display,
    fs,
    io::{self, prelude::*},
    path::Path,
};

use crate::io::compression::{sniff, strip_compression_extension, SNIFF_WINDOW};
use crate::io::container::is_manifest_path;

#[cfg(feature = "mzml")]
use crate::io::mzml::is_mzml;

/// The kinds of input [`open`](crate::io::open) knows how to read
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpectraFormat {
    MGF,
    APL,
    MzML,
    /// A compressed stream or a zip/tar archive
    Archive,
    /// A `.list`/`.msmlist` file naming other inputs
    Manifest,
    Directory,
}

impl Display for SpectraFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Whether a file or archive entry name is operating system debris rather than
/// data: anything under `__MACOSX`, `.DS_Store` files and `._` resource forks.
pub fn is_junk_name(name: &str) -> bool {
    let mut last = None;
    for component in name.split(['/', '\\']).filter(|c| !c.is_empty()) {
        if component.starts_with("__MACOSX") {
            return true;
        }
        last = Some(component);
    }
    last.is_some_and(|file_name| file_name.starts_with(".DS_Store") || file_name.starts_with("._"))
}

/// The lowercased extension of a name, ignoring any compression extension
fn leaf_extension(name: &str) -> Option<String> {
    let (_, name) = strip_compression_extension(name);
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Whether a name carries a bare `.gz` extension with nothing before it
fn is_bare_gzip_name(name: &str) -> bool {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => ext.eq_ignore_ascii_case("gz") && !stem.is_empty() && !stem.contains('.'),
        None => false,
    }
}

/// Choose a peak list dialect from a name alone, if its extension names one.
///
/// A bare `.gz` name is taken to be APL, the way MaxQuant ships its peak lists.
pub fn infer_from_name(name: &str) -> Option<SpectraFormat> {
    match leaf_extension(name).as_deref() {
        Some("apl") => Some(SpectraFormat::APL),
        Some("mzml") => Some(SpectraFormat::MzML),
        Some("mgf") => Some(SpectraFormat::MGF),
        _ if is_bare_gzip_name(name) => Some(SpectraFormat::APL),
        _ => None,
    }
}

/// Given the name of a stream and its leading bytes, infer how to read it.
///
/// Compressed and archived streams are recognized by their magic bytes. Other
/// streams are classified by extension, then by looking for an mzML root
/// element, and are otherwise read as MGF.
pub fn infer_from_stream(name: &str, header: &[u8]) -> SpectraFormat {
    if sniff(header).is_packaged() {
        return SpectraFormat::Archive;
    }
    match infer_from_name(name) {
        Some(format) => format,
        #[cfg(feature = "mzml")]
        None if is_mzml(header) => SpectraFormat::MzML,
        None => SpectraFormat::MGF,
    }
}

fn read_header(path: &Path) -> io::Result<Vec<u8>> {
    let handle = fs::File::open(path)?;
    let mut header = Vec::with_capacity(SNIFF_WINDOW);
    handle.take(SNIFF_WINDOW as u64).read_to_end(&mut header)?;
    Ok(header)
}

/// Given a path, infer how to read it using its name and, for files, its
/// leading bytes.
///
/// Files that are compressed or archived, or carry a `.zip` extension, are
/// archives. Otherwise `.apl` and `.mzML` files are read as such and anything
/// else as MGF.
pub fn infer_from_path(path: &Path) -> io::Result<SpectraFormat> {
    if path.is_dir() {
        return Ok(SpectraFormat::Directory);
    }
    if is_manifest_path(path) {
        return Ok(SpectraFormat::Manifest);
    }
    let header = read_header(path)?;
    let is_zip_name = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    if is_zip_name || sniff(&header).is_packaged() {
        return Ok(SpectraFormat::Archive);
    }
    let name = path.to_string_lossy();
    Ok(infer_from_name(&name).unwrap_or(SpectraFormat::MGF))
}
