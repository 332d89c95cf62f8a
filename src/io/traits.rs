use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::spectrum::Spectrum;

/// The stage of opening a source that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenStage {
    /// Reading the leading bytes to classify the input
    Sniff,
    /// Choosing a reader for the classified input
    Dispatch,
    /// Constructing the chosen reader and reading its first record
    Open,
}

impl fmt::Display for OpenStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpenStage::Sniff => "sniff",
            OpenStage::Dispatch => "dispatch",
            OpenStage::Open => "open",
        };
        f.write_str(name)
    }
}

/// The ways reading spectra can fail
#[derive(Debug, Error)]
pub enum SourceError {
    /// `restart` was requested on a tree holding a source that cannot be re-opened
    #[error("{0} cannot be restarted, it is not backed by a named file")]
    NotRestartable(String),
    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("I/O error occurred while reading: {0}")]
    Io(#[from] io::Error),
    /// An archive entry declares a suspicious compression ratio
    #[error("Archive entry {entry} declares a compression ratio of {ratio:.1}, above the limit of {limit}")]
    ArchiveCorrupt { entry: String, ratio: f64, limit: f64 },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A failure of [`open`](crate::io::open) or [`open_stream`](crate::io::open_stream)
    #[error("Failed to {stage} {path}: {source}")]
    Open {
        path: PathBuf,
        stage: OpenStage,
        #[source]
        source: Box<SourceError>,
    },
}

impl SourceError {
    pub(crate) fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn at_stage(self, path: impl Into<PathBuf>, stage: OpenStage) -> Self {
        match self {
            // Keep the innermost location, it is the most specific one
            Self::Open { .. } => self,
            _ => Self::Open {
                path: path.into(),
                stage,
                source: Box::new(self),
            },
        }
    }

    /// The underlying error, looking through [`SourceError::Open`]
    pub fn root(&self) -> &SourceError {
        match self {
            Self::Open { source, .. } => source.root(),
            _ => self,
        }
    }
}

/// Sizing statistics collected by [`SpectraSource::gather_data`]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GatherStats {
    /// The largest neutral precursor mass of any emitted spectrum, under its
    /// largest candidate charge
    pub max_precursor_mass: f64,
    pub spectra_count: u64,
}

impl GatherStats {
    pub fn observe(&mut self, spectrum: &Spectrum) {
        self.observe_mass(spectrum.max_precursor_mass());
    }

    pub(crate) fn observe_mass(&mut self, mass: f64) {
        self.max_precursor_mass = self.max_precursor_mass.max(mass);
        self.spectra_count += 1;
    }

    /// Fold another partial result into this one
    pub fn merge(self, other: GatherStats) -> GatherStats {
        GatherStats {
            max_precursor_mass: self.max_precursor_mass.max(other.max_precursor_mass),
            spectra_count: self.spectra_count + other.spectra_count,
        }
    }
}

/// The structural role of a source in a source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Decodes one flat file directly
    Leaf,
    /// Walks the entries of a compressed stream or archive
    Archive,
    /// Concatenates other sources
    Container,
}

/// A forward-only, pull-based source of [`Spectrum`].
///
/// Every source keeps exactly one spectrum of lookahead: [`SpectraSource::has_next`]
/// reports whether it is filled, and [`SpectraSource::read_next`] hands it out
/// and refills it. Sources are composed into trees, with the outer sources
/// pulling from their children on demand.
///
/// `Box<dyn SpectraSource>` is also an [`Iterator`] over `Result<Spectrum, SourceError>`.
pub trait SpectraSource: Send {
    /// Whether another spectrum (or a pending error) is buffered
    fn has_next(&self) -> bool;

    /// Hand out the buffered spectrum and buffer the next one.
    ///
    /// If decoding the following spectrum fails, the spectrum already decoded
    /// is still returned and the error is returned by the next call.
    fn read_next(&mut self) -> Result<Option<Spectrum>, SourceError>;

    /// The spectrum most recently returned by [`SpectraSource::read_next`]
    fn current(&self) -> Option<&Spectrum>;

    /// Re-open the source from its canonical identity and reposition at the
    /// first spectrum, resetting every counter.
    fn restart(&mut self) -> Result<(), SourceError>;

    /// Whether every leaf of this tree can be re-opened by name
    fn can_restart(&self) -> bool;

    /// Release all held resources. Safe to call repeatedly.
    fn close(&mut self);

    /// The number of spectra handed out since construction or the last restart
    fn count_read(&self) -> u64;

    /// Make one full pass over the source to compute [`GatherStats`], then
    /// [`SpectraSource::restart`] it.
    fn gather_data(&mut self, parallelism: usize) -> Result<GatherStats, SourceError>;

    /// The provenance trail of the spectrum being read
    fn input_path(&self) -> String;

    fn kind(&self) -> SourceKind;
}

impl Iterator for Box<dyn SpectraSource> {
    type Item = Result<Spectrum, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Join a container's own path to the trail of one of its children
pub(crate) fn compose_trail(own: &str, child: &str) -> String {
    match (own.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => own.to_string(),
        (false, false) => format!("{own}->{child}"),
    }
}

/// A restartable source refuses a gather pass up front if it cannot be restarted
/// afterwards, rather than leaving the tree consumed.
pub(crate) fn ensure_restartable<S: SpectraSource + ?Sized>(
    source: &S,
) -> Result<(), SourceError> {
    if source.can_restart() {
        Ok(())
    } else {
        Err(SourceError::NotRestartable(source.input_path()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trail() {
        assert_eq!(compose_trail("a.zip", "b.apl"), "a.zip->b.apl");
        assert_eq!(compose_trail("", "b.apl"), "b.apl");
        assert_eq!(compose_trail("a.zip", ""), "a.zip");
    }

    #[test]
    fn test_open_error_keeps_innermost() {
        let err = SourceError::UnsupportedFormat("x".into())
            .at_stage("inner", OpenStage::Dispatch)
            .at_stage("outer", OpenStage::Open);
        match &err {
            SourceError::Open { path, stage, .. } => {
                assert_eq!(path, &PathBuf::from("inner"));
                assert_eq!(*stage, OpenStage::Dispatch);
            }
            _ => panic!("unexpected {err:?}"),
        }
        assert!(matches!(err.root(), SourceError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_stats_merge() {
        let a = GatherStats {
            max_precursor_mass: 100.0,
            spectra_count: 2,
        };
        let b = GatherStats {
            max_precursor_mass: 300.0,
            spectra_count: 5,
        };
        assert_eq!(
            a.merge(b),
            GatherStats {
                max_precursor_mass: 300.0,
                spectra_count: 7
            }
        );
    }
}
