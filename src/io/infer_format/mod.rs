mod dispatch;
mod inference;

pub(crate) use dispatch::{dispatch_stream, open_with_settings};
pub use dispatch::{open, open_stream};

pub use inference::{infer_from_name, infer_from_path, infer_from_stream, is_junk_name, SpectraFormat};

#[cfg(test)]
mod test {
    use std::{fs, io::prelude::*, path};

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use crate::config::ReaderConfig;
    use crate::io::{OpenStage, SourceError, SourceKind, SpectraSource};
    use crate::mass_error::Tolerance;
    use crate::spectrum::Spectrum;

    use super::*;

    fn drain(source: &mut dyn SpectraSource) -> Result<Vec<Spectrum>, SourceError> {
        let mut spectra = Vec::new();
        while let Some(spectrum) = source.read_next()? {
            spectra.push(spectrum);
        }
        Ok(spectra)
    }

    #[test]
    fn infer_mgf() -> std::io::Result<()> {
        let path = path::Path::new("./test/data/small.mgf");
        assert!(path.exists());
        assert_eq!(infer_from_path(path)?, SpectraFormat::MGF);
        Ok(())
    }

    #[test]
    fn infer_apl() -> std::io::Result<()> {
        let path = path::Path::new("./test/data/small.apl");
        assert_eq!(infer_from_path(path)?, SpectraFormat::APL);
        Ok(())
    }

    #[test]
    fn infer_mzml() -> std::io::Result<()> {
        let path = path::Path::new("./test/data/small.mzML");
        assert_eq!(infer_from_path(path)?, SpectraFormat::MzML);
        Ok(())
    }

    #[test]
    fn infer_containers() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(infer_from_path(dir.path())?, SpectraFormat::Directory);

        let manifest = dir.path().join("inputs.MSMLIST");
        fs::write(&manifest, "a.mgf\n")?;
        assert_eq!(infer_from_path(&manifest)?, SpectraFormat::Manifest);

        // Named like a zip but holding text
        let zip_named = dir.path().join("broken.zip");
        fs::write(&zip_named, "BEGIN IONS\n")?;
        assert_eq!(infer_from_path(&zip_named)?, SpectraFormat::Archive);

        let gzipped = dir.path().join("peaks.txt");
        let mut encoder = GzEncoder::new(fs::File::create(&gzipped)?, Compression::default());
        encoder.write_all(b"BEGIN IONS\nEND IONS\n")?;
        encoder.finish()?;
        assert_eq!(infer_from_path(&gzipped)?, SpectraFormat::Archive);

        let unknown = dir.path().join("peaks.txt2");
        fs::write(&unknown, "BEGIN IONS\n")?;
        assert_eq!(infer_from_path(&unknown)?, SpectraFormat::MGF);
        Ok(())
    }

    #[test]
    fn infer_streams() {
        assert_eq!(infer_from_stream("x/b.apl", b"peaklist start\n"), SpectraFormat::APL);
        assert_eq!(infer_from_stream("b.APL.gz", b"peaklist start\n"), SpectraFormat::APL);
        assert_eq!(infer_from_stream("b.mzML", b"<?xml"), SpectraFormat::MzML);
        assert_eq!(infer_from_stream("b.txt", b"BEGIN IONS\n"), SpectraFormat::MGF);
        assert_eq!(infer_from_stream("b.txt", b"\x1f\x8b\x08\x00"), SpectraFormat::Archive);
        assert_eq!(infer_from_stream("b", b"PK\x03\x04"), SpectraFormat::Archive);
        assert_eq!(infer_from_stream("allSpectra.gz", b"peaklist start\n"), SpectraFormat::APL);
        assert_eq!(infer_from_stream("b.txt.gz", b"BEGIN IONS\n"), SpectraFormat::MGF);
        #[cfg(feature = "mzml")]
        assert_eq!(
            infer_from_stream("b.xml", b"<?xml version=\"1.0\"?>\n<mzML>"),
            SpectraFormat::MzML
        );
    }

    #[test]
    fn junk_names() {
        assert!(is_junk_name("__MACOSX/data/b.apl"));
        assert!(is_junk_name("data/__MACOSX/b.apl"));
        assert!(is_junk_name("data/._b.apl"));
        assert!(is_junk_name(".DS_Store"));
        assert!(is_junk_name("/tmp/run/.DS_Store"));
        assert!(!is_junk_name("data/b.apl"));
        assert!(!is_junk_name("data/.hidden.mgf"));
        assert!(!is_junk_name(""));
    }

    #[test_log::test]
    fn test_open_leaf() -> Result<(), SourceError> {
        let mut source = open("./test/data/small.mgf", Tolerance::PPM(20.0), 1, ReaderConfig::default())?;
        assert_eq!(source.kind(), SourceKind::Leaf);
        assert!(source.can_restart());
        let spectra = drain(source.as_mut())?;
        assert_eq!(spectra.len(), 5);
        assert!(spectra.iter().all(|s| s.tolerance == Some(Tolerance::PPM(20.0))));

        let mut source = open("./test/data/small.apl", Tolerance::default(), 1, ReaderConfig::default())?;
        assert_eq!(drain(source.as_mut())?.len(), 3);
        Ok(())
    }

    #[test_log::test]
    fn test_open_compressed_leaf() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("small.apl.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&path)?, Compression::default());
        encoder.write_all(&fs::read("./test/data/small.apl")?)?;
        encoder.finish()?;

        let mut source = open(&path, Tolerance::default(), 1, ReaderConfig::default())?;
        assert_eq!(source.kind(), SourceKind::Archive);
        let spectra = drain(source.as_mut())?;
        assert_eq!(spectra.len(), 3);
        assert_eq!(spectra[0].run, "run_a");
        Ok(())
    }

    #[test_log::test]
    fn test_open_directory() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        fs::copy("./test/data/small.mgf", dir.path().join("b.mgf"))?;
        fs::copy("./test/data/small.apl", dir.path().join("a.apl"))?;
        fs::write(dir.path().join("._a.apl"), "junk")?;

        let mut source = open(dir.path(), Tolerance::default(), 1, ReaderConfig::default())?;
        assert_eq!(source.kind(), SourceKind::Container);
        let spectra = drain(source.as_mut())?;
        assert_eq!(spectra.len(), 8);
        assert!(spectra[0].source.ends_with("a.apl"));
        assert!(spectra[7].source.ends_with("b.mgf"));
        Ok(())
    }

    #[test_log::test]
    fn test_open_failures() {
        match open("./test/data/missing.mgf", Tolerance::default(), 1, ReaderConfig::default()) {
            Err(SourceError::Open { path, stage, source }) => {
                assert_eq!(stage, OpenStage::Sniff);
                assert!(path.ends_with("missing.mgf"));
                assert!(matches!(*source, SourceError::Io(_)));
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("a missing file should not open"),
        }

        let result = open("./test/data/.DS_Store", Tolerance::default(), 1, ReaderConfig::default());
        assert!(matches!(
            result.map(|_| ()).unwrap_err().root(),
            SourceError::UnsupportedFormat(_)
        ));

        let result = open_stream(
            "bad.mgf",
            std::io::Cursor::new(b"BEGIN IONS\nPEPMASS=400\nEND IONS\n".to_vec()),
            Tolerance::default(),
            1,
            ReaderConfig::default(),
        );
        match result {
            Err(SourceError::Open { stage, source, .. }) => {
                assert_eq!(stage, OpenStage::Open);
                assert!(matches!(*source, SourceError::MalformedRecord { .. }));
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("a record without a title should not parse"),
        }
    }

    #[test_log::test]
    fn test_open_stream() -> Result<(), SourceError> {
        let text = "BEGIN IONS\nTITLE=foo.1.1.2\nPEPMASS=500.5 1000\nCHARGE=2+\n100.1 50\n200.2 25\nEND IONS\n";
        let mut source = open_stream(
            "upload.mgf",
            std::io::Cursor::new(text.as_bytes().to_vec()),
            Tolerance::default(),
            1,
            ReaderConfig::default(),
        )?;
        assert!(!source.can_restart());
        assert!(matches!(source.restart(), Err(SourceError::NotRestartable(_))));
        let spectra = drain(source.as_mut())?;
        assert_eq!(spectra.len(), 1);
        assert_eq!(spectra[0].source, "upload.mgf");
        assert_eq!(spectra[0].precursor_mz, 500.5);

        let empty = open_stream(
            "empty.mgf",
            std::io::empty(),
            Tolerance::default(),
            1,
            ReaderConfig::default(),
        );
        assert!(empty.is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_iterator() -> Result<(), SourceError> {
        let source = open("./test/data/small.mgf", Tolerance::default(), 2, ReaderConfig::default())?;
        let spectra: Vec<Spectrum> = source.collect::<Result<_, _>>()?;
        assert_eq!(spectra.len(), 4);
        Ok(())
    }
}
