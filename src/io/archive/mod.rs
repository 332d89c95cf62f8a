//! Read spectra out of compressed streams and archives.
//!
//! An [`ArchiveSource`] removes any compression layers from its input, then
//! walks the entries of a zip or tar archive, handing each file to the reader
//! [`dispatch_stream`](crate::io::infer_format::dispatch_stream) picks for it,
//! recursing into nested archives. A compressed stream that is not an archive
//! is read as a single unnamed entry.
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::config::SourceSettings;
use crate::io::compression::{
    decompress, sniff, strip_compression_extension, BoxedReader, StreamFormat, SNIFF_WINDOW,
};
use crate::io::infer_format::dispatch_stream;
use crate::io::lookahead::{Lookahead, PullSpectra};
use crate::io::traits::{
    compose_trail, ensure_restartable, GatherStats, SourceError, SourceKind, SpectraSource,
};
use crate::spectrum::Spectrum;

mod pump;

pub use pump::EntryMeta;
use pump::{EntryPump, PumpInput};

/// How many archives may be nested inside one another
pub const MAX_ARCHIVE_DEPTH: usize = 8;

struct OpenedEntry {
    name: String,
    reader: BoxedReader,
}

enum EntryCursor {
    /// A compressed stream holding one file
    Single(Option<OpenedEntry>),
    Entries(EntryPump),
}

/// The last path segment of `name`, with `layers` compression extensions removed
fn payload_name(name: &str, layers: usize) -> String {
    let mut stem = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    for _ in 0..layers {
        match strip_compression_extension(&stem) {
            // `peaks.gz` keeps its name so the bare `.gz` dialect rule still applies
            (true, rest) if !rest.contains('.') => break,
            (true, rest) => stem = rest.to_string(),
            (false, _) => break,
        }
    }
    stem
}

pub(crate) struct ArchivePull {
    // Declared first so an open entry is released before the cursor feeding it
    child: Option<Box<dyn SpectraSource>>,
    cursor: Option<EntryCursor>,
    name: String,
    settings: Arc<SourceSettings>,
    depth: usize,
}

impl ArchivePull {
    fn open(
        name: &str,
        reader: BoxedReader,
        settings: Arc<SourceSettings>,
        depth: usize,
    ) -> Result<Self, SourceError> {
        let decompressed = decompress(reader)?;
        let cursor = if decompressed.format.is_archive() {
            debug!("Reading {} entries from {name}", decompressed.format);
            EntryCursor::Entries(EntryPump::spawn(
                PumpInput::Stream(decompressed.format, Box::new(decompressed.reader)),
                name,
            )?)
        } else {
            EntryCursor::Single(Some(OpenedEntry {
                name: payload_name(name, decompressed.layers),
                reader: Box::new(decompressed.reader),
            }))
        };
        Ok(Self::with_cursor(name, cursor, settings, depth))
    }

    /// Open a file on disk, reading an uncompressed zip in place
    fn open_file(
        name: &str,
        path: &Path,
        settings: Arc<SourceSettings>,
        depth: usize,
    ) -> Result<Self, SourceError> {
        let mut handle = fs::File::open(path)?;
        let mut header = Vec::with_capacity(SNIFF_WINDOW);
        (&mut handle)
            .take(SNIFF_WINDOW as u64)
            .read_to_end(&mut header)?;
        handle.rewind()?;
        if sniff(&header) != StreamFormat::Zip {
            return Self::open(name, Box::new(handle), settings, depth);
        }
        debug!("Reading zip entries from {name}");
        let cursor = EntryCursor::Entries(EntryPump::spawn(PumpInput::ZipFile(handle), name)?);
        Ok(Self::with_cursor(name, cursor, settings, depth))
    }

    fn with_cursor(
        name: &str,
        cursor: EntryCursor,
        settings: Arc<SourceSettings>,
        depth: usize,
    ) -> Self {
        Self {
            child: None,
            cursor: Some(cursor),
            name: name.to_string(),
            settings,
            depth,
        }
    }

    fn check_ratio(&self, meta: &EntryMeta) -> Result<(), SourceError> {
        let limit = self.settings.config.max_compression_ratio;
        match meta.compression_ratio() {
            Some(ratio) if ratio > limit => Err(SourceError::ArchiveCorrupt {
                entry: compose_trail(&self.name, &meta.name),
                ratio,
                limit,
            }),
            _ => Ok(()),
        }
    }

    fn next_entry(&mut self) -> Result<Option<OpenedEntry>, SourceError> {
        let entry = match self.cursor.as_mut() {
            None => None,
            Some(EntryCursor::Single(entry)) => entry.take(),
            Some(EntryCursor::Entries(pump)) => match pump.next_entry()? {
                Some((meta, reader)) => {
                    self.check_ratio(&meta)?;
                    Some(OpenedEntry {
                        name: meta.name,
                        reader: Box::new(reader),
                    })
                }
                None => None,
            },
        };
        Ok(entry)
    }

    fn is_single(&self) -> bool {
        matches!(self.cursor, Some(EntryCursor::Single(_)))
    }

    fn relabel(&self, spectrum: &mut Spectrum) {
        if self.is_single() {
            spectrum.source.clone_from(&self.name);
        } else {
            spectrum.source = compose_trail(&self.name, &spectrum.source);
        }
    }

    fn input_path(&self) -> String {
        match self.child.as_ref() {
            Some(child) if !self.is_single() => compose_trail(&self.name, &child.input_path()),
            _ => self.name.clone(),
        }
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.close();
        }
        self.cursor = None;
    }

    fn pull_inner(&mut self) -> Result<Option<Spectrum>, SourceError> {
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(mut spectrum) = child.read_next()? {
                    self.relabel(&mut spectrum);
                    return Ok(Some(spectrum));
                }
                if let Some(mut child) = self.child.take() {
                    child.close();
                }
            }
            let Some(entry) = self.next_entry()? else {
                return Ok(None);
            };
            self.child = dispatch_stream(&entry.name, entry.reader, &self.settings, self.depth)?;
            if self.child.is_none() {
                debug!("Skipped entry {} of {}", entry.name, self.name);
            }
        }
    }
}

impl PullSpectra for ArchivePull {
    fn pull(&mut self) -> Result<Option<Spectrum>, SourceError> {
        match self.pull_inner() {
            Ok(Some(spectrum)) => Ok(Some(spectrum)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }
}

/// A [`SpectraSource`] over a compressed file or an archive of spectrum files
pub struct ArchiveSource {
    name: String,
    path: Option<PathBuf>,
    settings: Arc<SourceSettings>,
    depth: usize,
    state: Lookahead<ArchivePull>,
}

impl ArchiveSource {
    pub fn open_path(
        path: impl AsRef<Path>,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let path = std::path::absolute(path.as_ref())?;
        let name = path.display().to_string();
        let pull = ArchivePull::open_file(&name, &path, settings.clone(), 1)?;
        Self::build(name, Some(path), pull, settings, 0)
    }

    /// Read from an anonymous stream. The source cannot be restarted.
    pub fn from_reader(
        name: impl Into<String>,
        reader: BoxedReader,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let pull = ArchivePull::open(&name, reader, settings.clone(), 1)?;
        Self::build(name, None, pull, settings, 0)
    }

    pub(crate) fn nested(
        name: &str,
        reader: BoxedReader,
        settings: Arc<SourceSettings>,
        depth: usize,
    ) -> Result<Self, SourceError> {
        if depth > MAX_ARCHIVE_DEPTH {
            return Err(SourceError::UnsupportedFormat(format!(
                "{name} is nested more than {MAX_ARCHIVE_DEPTH} archives deep"
            )));
        }
        let pull = ArchivePull::open(name, reader, settings.clone(), depth + 1)?;
        Self::build(name.to_string(), None, pull, settings, depth)
    }

    fn build(
        name: String,
        path: Option<PathBuf>,
        pull: ArchivePull,
        settings: Arc<SourceSettings>,
        depth: usize,
    ) -> Result<Self, SourceError> {
        let state = Lookahead::primed(pull)?;
        Ok(Self {
            name,
            path,
            settings,
            depth,
            state,
        })
    }

    fn reopen(&self) -> Result<ArchivePull, SourceError> {
        let Some(path) = self.path.as_ref() else {
            return Err(SourceError::NotRestartable(self.name.clone()));
        };
        ArchivePull::open_file(&self.name, path, self.settings.clone(), self.depth + 1)
    }
}

impl SpectraSource for ArchiveSource {
    fn has_next(&self) -> bool {
        self.state.has_next()
    }

    fn read_next(&mut self) -> Result<Option<Spectrum>, SourceError> {
        self.state.advance()
    }

    fn current(&self) -> Option<&Spectrum> {
        self.state.current()
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        let pull = self.reopen()?;
        debug!("Restarting {}", self.name);
        self.close();
        self.state.reset(pull)
    }

    fn can_restart(&self) -> bool {
        self.path.is_some()
    }

    fn close(&mut self) {
        self.state.inner_mut().close();
    }

    fn count_read(&self) -> u64 {
        self.state.count_read()
    }

    fn gather_data(&mut self, _parallelism: usize) -> Result<GatherStats, SourceError> {
        ensure_restartable(self)?;
        let start = Instant::now();
        let mut pass = self.reopen()?;
        let mut stats = GatherStats::default();
        while let Some(spectrum) = pass.pull()? {
            stats.observe(&spectrum);
        }
        info!(
            "Gathered {} spectra with a maximum precursor mass of {:.4} from {} in {:.3}s",
            stats.spectra_count,
            stats.max_precursor_mass,
            self.name,
            start.elapsed().as_secs_f64()
        );
        self.restart()?;
        Ok(stats)
    }

    fn input_path(&self) -> String {
        self.state.inner().input_path()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::mass_error::Tolerance;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const MGF: &str = "./test/data/small.mgf";
    const APL: &str = "./test/data/small.apl";

    fn settings_with(config: ReaderConfig) -> Arc<SourceSettings> {
        SourceSettings::new(Tolerance::default(), 1, config)
            .unwrap()
            .shared()
    }

    fn settings() -> Arc<SourceSettings> {
        settings_with(ReaderConfig::default())
    }

    fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) -> io::Result<()> {
        let mut zip = ZipWriter::new(fs::File::create(path)?);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        zip.add_directory("data/", options)?;
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    /// A zip written without seeking, so each entry's sizes follow its data in a
    /// data descriptor rather than preceding it in the local header
    fn write_streamed_zip(path: &Path, entries: &[(&str, Vec<u8>)]) -> io::Result<()> {
        let mut zip = ZipWriter::new_stream(fs::File::create(path)?);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    fn drain(source: &mut dyn SpectraSource) -> Result<Vec<Spectrum>, SourceError> {
        let mut spectra = Vec::new();
        while let Some(spectrum) = source.read_next()? {
            spectra.push(spectrum);
        }
        Ok(spectra)
    }

    #[test_log::test]
    fn test_zip_entries() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.zip");
        write_zip(
            &path,
            &[
                ("data/b.apl", fs::read(APL)?),
                ("__MACOSX/data/._b.apl", b"junk".to_vec()),
                ("data/c.mgf", fs::read(MGF)?),
            ],
        )?;
        let mut source = ArchiveSource::open_path(&path, settings())?;
        assert_eq!(source.kind(), SourceKind::Archive);
        assert!(source.can_restart());
        assert!(source.input_path().ends_with("a.zip->data/b.apl"));

        let spectra = drain(&mut source)?;
        assert_eq!(spectra.len(), 8);
        assert!(spectra[0].source.ends_with("a.zip->data/b.apl"));
        assert!(spectra[7].source.ends_with("a.zip->data/c.mgf"));
        let ids: Vec<u64> = spectra.iter().map(|s| s.read_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 3, 4]);
        assert_eq!(source.count_read(), 8);

        let stats = source.gather_data(1)?;
        assert_eq!(stats.spectra_count, 8);
        assert_eq!(source.count_read(), 0);
        let again = drain(&mut source)?;
        assert_eq!(again, spectra);

        source.close();
        source.close();
        assert!(source.read_next()?.is_none());
        Ok(())
    }

    #[test_log::test]
    fn test_nested_archives() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let inner = dir.path().join("inner.zip");
        write_zip(&inner, &[("data/c.mgf", fs::read(MGF)?)])?;

        let mut compressed = GzEncoder::new(Vec::new(), Compression::default());
        compressed.write_all(&fs::read(APL)?)?;
        let compressed = compressed.finish()?;

        let outer = dir.path().join("outer.zip");
        write_zip(
            &outer,
            &[("inner.zip", fs::read(&inner)?), ("b.apl.gz", compressed)],
        )?;
        let mut source = ArchiveSource::open_path(&outer, settings())?;
        let spectra = drain(&mut source)?;
        assert_eq!(spectra.len(), 8);
        assert!(spectra[0].source.ends_with("outer.zip->inner.zip->data/c.mgf"));
        assert!(spectra[5].source.ends_with("outer.zip->b.apl.gz"));
        assert_eq!(spectra[5].run, "run_a");
        Ok(())
    }

    #[test_log::test]
    fn test_tar_gz() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spectra.tar.gz");
        let mut builder = tar::Builder::new(GzEncoder::new(
            fs::File::create(&path)?,
            Compression::default(),
        ));
        builder.append_path_with_name(MGF, "run/small.mgf")?;
        builder.append_path_with_name(APL, "run/small.apl")?;
        builder.into_inner()?.finish()?;

        let mut source = ArchiveSource::open_path(&path, settings())?;
        let spectra = drain(&mut source)?;
        assert_eq!(spectra.len(), 8);
        assert!(spectra[0].source.ends_with("spectra.tar.gz->run/small.mgf"));
        assert!(spectra[7].source.ends_with("spectra.tar.gz->run/small.apl"));
        Ok(())
    }

    #[test_log::test]
    fn test_single_compressed_stream() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.mgf.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&path)?, Compression::default());
        encoder.write_all(&fs::read(MGF)?)?;
        encoder.finish()?;

        let mut source = ArchiveSource::open_path(&path, settings())?;
        let spectra = drain(&mut source)?;
        assert_eq!(spectra.len(), 5);
        let expected = std::path::absolute(&path)?.display().to_string();
        assert!(spectra.iter().all(|s| s.source == expected));
        assert_eq!(source.input_path(), expected);
        Ok(())
    }

    #[cfg(feature = "zstd")]
    #[test_log::test]
    fn test_zstd_stream() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.mgf.zst");
        let compressed = zstd::encode_all(fs::File::open(MGF)?, 3)?;
        fs::write(&path, compressed)?;

        let mut source = ArchiveSource::open_path(&path, settings())?;
        assert_eq!(drain(&mut source)?.len(), 5);
        Ok(())
    }

    #[test_log::test]
    fn test_compression_ratio_guard() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bomb.zip");
        write_zip(&path, &[("zeros.mgf", vec![0u8; 1 << 20])])?;

        match ArchiveSource::open_path(&path, settings()) {
            Err(SourceError::ArchiveCorrupt { entry, ratio, limit }) => {
                assert!(entry.ends_with("bomb.zip->zeros.mgf"));
                assert!(ratio > limit);
                assert_eq!(limit, 100.0);
            }
            Err(e) => panic!("Expected ArchiveCorrupt, got {e}"),
            Ok(_) => panic!("Expected ArchiveCorrupt"),
        }

        let relaxed = ReaderConfig::default().with_max_compression_ratio(1e9);
        let mut source = ArchiveSource::open_path(&path, settings_with(relaxed))?;
        assert!(!source.has_next());
        assert!(source.read_next()?.is_none());
        Ok(())
    }

    #[test_log::test]
    fn test_stream_not_restartable() -> Result<(), SourceError> {
        let mut compressed = GzEncoder::new(Vec::new(), Compression::default());
        compressed.write_all(&fs::read(MGF)?)?;
        let reader = io::Cursor::new(compressed.finish()?);
        let mut source = ArchiveSource::from_reader("stdin.mgf.gz", Box::new(reader), settings())?;
        assert!(!source.can_restart());
        assert!(matches!(
            source.gather_data(1),
            Err(SourceError::NotRestartable(_))
        ));
        assert!(source.read_next()?.is_some());
        assert!(matches!(source.restart(), Err(SourceError::NotRestartable(_))));
        Ok(())
    }

    #[test_log::test]
    fn test_zip_with_data_descriptors() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("finder.zip");
        write_streamed_zip(
            &path,
            &[
                ("__MACOSX/._c.mgf", b"junk".to_vec()),
                ("c.mgf", fs::read(MGF)?),
                ("b.apl", fs::read(APL)?),
            ],
        )?;
        let mut source = crate::io::open(&path, Tolerance::default(), 1, ReaderConfig::default())?;
        assert_eq!(source.kind(), SourceKind::Archive);
        let spectra = drain(source.as_mut())?;
        assert_eq!(spectra.len(), 8);
        assert!(spectra[0].source.ends_with("finder.zip->c.mgf"));
        assert!(spectra[7].source.ends_with("finder.zip->b.apl"));
        assert_eq!(source.gather_data(1)?.spectra_count, 8);

        let bytes = fs::read(&path)?;
        let mut streamed =
            ArchiveSource::from_reader("upload.zip", Box::new(io::Cursor::new(bytes)), settings())?;
        assert_eq!(drain(&mut streamed)?.len(), 8);
        Ok(())
    }

    #[test_log::test]
    fn test_ratio_guard_on_streamed_zip() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bomb.zip");
        write_streamed_zip(&path, &[("zeros.mgf", vec![0u8; 1 << 20])])?;
        assert!(matches!(
            ArchiveSource::open_path(&path, settings()),
            Err(SourceError::ArchiveCorrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_payload_name() {
        assert_eq!(payload_name("/tmp/x/small.mgf.gz", 1), "small.mgf");
        assert_eq!(payload_name("small.mgf.gz.bz2", 2), "small.mgf");
        assert_eq!(payload_name("small.zip", 0), "small.zip");
        assert_eq!(payload_name("peaks.gz", 1), "peaks.gz");
    }
}
