use std::{
    io::{self, BufReader},
    path::Path,
    sync::Arc,
};

use log::debug;

use crate::config::{ReaderConfig, SourceSettings};
use crate::io::apl::APLSource;
use crate::io::archive::ArchiveSource;
use crate::io::compression::{BoxedReader, SniffedReader};
use crate::io::container::ContainerSource;
use crate::io::mgf::MGFSource;
#[cfg(feature = "mzml")]
use crate::io::mzml::MzMLSource;
use crate::io::traits::{OpenStage, SourceError, SpectraSource};
use crate::mass_error::Tolerance;

use super::{infer_from_path, infer_from_stream, is_junk_name, SpectraFormat};

#[cfg(not(feature = "mzml"))]
fn mzml_unavailable(name: &str) -> SourceError {
    SourceError::UnsupportedFormat(format!(
        "{name} is mzML, but mzML support was not enabled"
    ))
}

/// Build the source for `path`, or `None` when the path is operating system debris.
///
/// Errors are wrapped in [`SourceError::Open`], unless a nested source already
/// reported a more specific location.
pub(crate) fn open_with_settings(
    path: &Path,
    settings: &Arc<SourceSettings>,
) -> Result<Option<Box<dyn SpectraSource>>, SourceError> {
    if is_junk_name(&path.to_string_lossy()) {
        debug!("Ignoring {}", path.display());
        return Ok(None);
    }
    let format =
        infer_from_path(path).map_err(|e| SourceError::from(e).at_stage(path, OpenStage::Sniff))?;
    debug!("Opening {} as {format}", path.display());
    let settings = settings.clone();
    let source: Box<dyn SpectraSource> = match format {
        SpectraFormat::Directory => Box::new(
            ContainerSource::from_directory(path, settings)
                .map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
        SpectraFormat::Manifest => Box::new(
            ContainerSource::from_manifest(path, settings)
                .map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
        SpectraFormat::Archive => Box::new(
            ArchiveSource::open_path(path, settings)
                .map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
        SpectraFormat::APL => Box::new(
            APLSource::open_path(path, settings).map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
        #[cfg(feature = "mzml")]
        SpectraFormat::MzML => Box::new(
            MzMLSource::open_path(path, settings)
                .map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
        #[cfg(not(feature = "mzml"))]
        SpectraFormat::MzML => {
            return Err(mzml_unavailable(&path.to_string_lossy()).at_stage(path, OpenStage::Dispatch))
        }
        SpectraFormat::MGF => Box::new(
            MGFSource::open_path(path, settings).map_err(|e| e.at_stage(path, OpenStage::Open))?,
        ),
    };
    Ok(Some(source))
}

/// Build the source for a named stream, such as an archive entry, or `None`
/// when the name is operating system debris or the stream is empty.
///
/// `depth` counts the archives enclosing the stream.
pub(crate) fn dispatch_stream(
    name: &str,
    reader: BoxedReader,
    settings: &Arc<SourceSettings>,
    depth: usize,
) -> Result<Option<Box<dyn SpectraSource>>, SourceError> {
    if is_junk_name(name) {
        debug!("Ignoring {name}");
        return Ok(None);
    }
    let sniffed =
        SniffedReader::new(reader).map_err(|e| SourceError::from(e).at_stage(name, OpenStage::Sniff))?;
    if sniffed.is_empty() {
        debug!("Ignoring empty {name}");
        return Ok(None);
    }
    let format = infer_from_stream(name, sniffed.header());
    debug!("Reading {name} as {format}");
    let settings = settings.clone();
    let source: Box<dyn SpectraSource> = match format {
        SpectraFormat::Archive => Box::new(
            ArchiveSource::nested(name, Box::new(sniffed), settings, depth)
                .map_err(|e| e.at_stage(name, OpenStage::Open))?,
        ),
        SpectraFormat::APL => Box::new(
            APLSource::from_reader(name, Box::new(BufReader::new(sniffed)), settings)
                .map_err(|e| e.at_stage(name, OpenStage::Open))?,
        ),
        #[cfg(feature = "mzml")]
        SpectraFormat::MzML => Box::new(
            MzMLSource::from_reader(name, Box::new(BufReader::new(sniffed)), settings)
                .map_err(|e| e.at_stage(name, OpenStage::Open))?,
        ),
        #[cfg(not(feature = "mzml"))]
        SpectraFormat::MzML => return Err(mzml_unavailable(name).at_stage(name, OpenStage::Dispatch)),
        SpectraFormat::MGF => Box::new(
            MGFSource::from_reader(name, Box::new(BufReader::new(sniffed)), settings)
                .map_err(|e| e.at_stage(name, OpenStage::Open))?,
        ),
        SpectraFormat::Manifest | SpectraFormat::Directory => {
            return Err(SourceError::UnsupportedFormat(format!(
                "{name} cannot be read as a stream"
            ))
            .at_stage(name, OpenStage::Dispatch))
        }
    };
    Ok(Some(source))
}

/// Open whatever `path` names, a peak list file, a compressed file, an
/// archive, a directory or a manifest, as one [`SpectraSource`].
///
/// ```no_run
/// use msaccess::io::{open, SpectraSource};
/// use msaccess::{ReaderConfig, Tolerance};
///
/// let mut source = open("spectra.zip", Tolerance::PPM(20.0), 1, ReaderConfig::default())?;
/// while let Some(spectrum) = source.read_next()? {
///     println!("{} {}", spectrum.source, spectrum.title);
/// }
/// # Ok::<(), msaccess::io::SourceError>(())
/// ```
pub fn open(
    path: impl AsRef<Path>,
    tolerance: Tolerance,
    min_charge: i32,
    config: ReaderConfig,
) -> Result<Box<dyn SpectraSource>, SourceError> {
    let path = path.as_ref();
    let settings = SourceSettings::new(tolerance, min_charge, config)?.shared();
    match open_with_settings(path, &settings)? {
        Some(source) => Ok(source),
        None => Err(SourceError::UnsupportedFormat(format!(
            "{} is not a spectrum file",
            path.display()
        ))
        .at_stage(path, OpenStage::Dispatch)),
    }
}

/// Read spectra from an anonymous stream, choosing the reader from `name` and
/// the stream's leading bytes. The returned source cannot be restarted.
pub fn open_stream(
    name: &str,
    reader: impl io::Read + Send + 'static,
    tolerance: Tolerance,
    min_charge: i32,
    config: ReaderConfig,
) -> Result<Box<dyn SpectraSource>, SourceError> {
    let settings = SourceSettings::new(tolerance, min_charge, config)?.shared();
    match dispatch_stream(name, Box::new(reader), &settings, 0)? {
        Some(source) => Ok(source),
        None => Err(SourceError::UnsupportedFormat(format!(
            "{name} holds no spectrum data"
        ))
        .at_stage(name, OpenStage::Dispatch)),
    }
}
