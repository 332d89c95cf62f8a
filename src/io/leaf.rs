//! The shared half of every flat-file reader.
//!
//! A dialect only has to turn lines (or XML events) into [`Spectrum`] records
//! by implementing [`RecordParser`]. [`LeafSource`] wraps it with the lookahead
//! buffer, numbering, defaults, restart and statistics gathering.
use std::fs;
use std::io::{self, prelude::*, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use log::{debug, info, warn};
use regex::Regex;

use crate::config::SourceSettings;
use crate::spectrum::Spectrum;

use super::compression::decompress;
use super::lookahead::{Lookahead, PullSpectra};
use super::traits::{ensure_restartable, GatherStats, SourceError, SourceKind, SpectraSource};

pub type BoxedBufRead = Box<dyn BufRead + Send>;

static PEAK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9.]+(?:[Ee][-+]?[0-9]+)?)\s+([0-9.]+(?:[Ee][-+]?[0-9]+)?)(?:\s+[-+]?[0-9]+[-+]?)?$",
    )
    .unwrap()
});

/// Recognize an `m/z intensity` peak line. The inner `None` marks a line shaped
/// like a peak whose numbers still failed to parse.
pub(crate) fn parse_peak_line(line: &str) -> Option<Option<(f64, f64)>> {
    let caps = PEAK_LINE.captures(line)?;
    match (caps[1].parse::<f64>(), caps[2].parse::<f64>()) {
        (Ok(mz), Ok(intensity)) => Some(Some((mz, intensity))),
        _ => Some(None),
    }
}

/// The text following `key` (matched case-insensitively) up to the next `word:`
/// token. Keys can be two words long (`Elution from:`), so a lone alphabetic
/// word right before that token is left out too.
pub(crate) fn value_after(text: &str, key: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    let start = lowered.find(&key.to_ascii_lowercase())? + key.len();
    let mut tokens: Vec<&str> = text[start..]
        .split_whitespace()
        .take_while(|token| !token.ends_with(':'))
        .collect();
    let hit_key = tokens.len() < text[start..].split_whitespace().count();
    if hit_key
        && tokens.len() > 1
        && tokens
            .last()
            .is_some_and(|word| word.chars().all(|c| c.is_ascii_alphabetic()))
    {
        tokens.pop();
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Open a file for line reading, decompressing it if it is compressed
pub(crate) fn open_path_reader(path: &Path) -> Result<BoxedBufRead, SourceError> {
    let handle = fs::File::open(path)?;
    let decoded = decompress(Box::new(handle))?;
    Ok(Box::new(BufReader::new(decoded.reader)))
}

/// How the charge of a record was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargeResolution {
    Definite(i32),
    Ambiguous,
}

/// The charge range a reader assumes for records of unknown charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChargePolicy {
    pub min_charge: i32,
    pub max_charge: i32,
    pub default_charge: i32,
}

impl ChargePolicy {
    pub(crate) fn new(settings: &SourceSettings, dialect_max_charge: i32) -> Self {
        Self {
            min_charge: settings.min_charge,
            max_charge: settings.config.max_charge.unwrap_or(dialect_max_charge),
            default_charge: settings.config.default_charge,
        }
    }

    pub(crate) fn unknown_range(&self) -> Vec<i32> {
        let range: Vec<i32> = (self.min_charge..=self.max_charge).collect();
        if range.is_empty() {
            vec![self.default_charge]
        } else {
            range
        }
    }

    /// Resolve the declared charge tokens of one record. `None` means no charge
    /// was declared at all.
    pub(crate) fn resolve<S: AsRef<str>>(
        &self,
        tokens: Option<&[S]>,
        mut on_unparseable: impl FnMut(&str),
    ) -> ChargeResolution {
        match tokens {
            Some([token]) if !token.as_ref().trim().is_empty() => {
                let token = token.as_ref().trim();
                match parse_charge(token) {
                    Some(z) => ChargeResolution::Definite(z),
                    None => {
                        on_unparseable(token);
                        ChargeResolution::Definite(1)
                    }
                }
            }
            _ => ChargeResolution::Ambiguous,
        }
    }

    /// Apply a resolution to `spectrum`, returning whether it should be kept
    pub(crate) fn apply(&self, spectrum: &mut Spectrum, resolution: ChargeResolution) -> bool {
        match resolution {
            ChargeResolution::Definite(z) => {
                spectrum.set_charge(z);
                z >= self.min_charge
            }
            ChargeResolution::Ambiguous => {
                spectrum.set_ambiguous_charge(self.default_charge, self.unknown_range());
                true
            }
        }
    }

    /// The charge a fast statistics scan should compute the mass at
    pub(crate) fn charge_for_mass(&self, resolution: ChargeResolution) -> Option<i32> {
        match resolution {
            ChargeResolution::Definite(z) if z >= self.min_charge => Some(z),
            ChargeResolution::Definite(_) => None,
            ChargeResolution::Ambiguous => self.unknown_range().into_iter().max(),
        }
    }
}

/// Parse a charge token like `2`, `2+` or `+2`
pub(crate) fn parse_charge(token: &str) -> Option<i32> {
    let token = token.trim();
    let token = token.strip_suffix('+').unwrap_or(token);
    let token = token.strip_prefix('+').unwrap_or(token);
    token.trim().parse().ok()
}

/// Decodes one flat file format into spectra, one record at a time
pub trait RecordParser: Send + Sized {
    fn from_reader(
        reader: BoxedBufRead,
        name: &str,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError>;

    /// Decode the next record that should be emitted, skipping filtered ones
    fn read_record(&mut self) -> Result<Option<Spectrum>, SourceError>;

    /// Compute the statistics a full pass over `reader` would produce
    fn scan_stats(
        reader: BoxedBufRead,
        name: &str,
        settings: Arc<SourceSettings>,
    ) -> Result<GatherStats, SourceError> {
        let mut parser = Self::from_reader(reader, name, settings)?;
        let mut stats = GatherStats::default();
        while let Some(spectrum) = parser.read_record()? {
            stats.observe(&spectrum);
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeafOrigin {
    Path(PathBuf),
    Stream,
}

pub(crate) struct LeafPull<P: RecordParser> {
    parser: Option<P>,
    name: String,
    next_id: u64,
    settings: Arc<SourceSettings>,
}

impl<P: RecordParser> LeafPull<P> {
    fn new(parser: P, name: String, settings: Arc<SourceSettings>) -> Self {
        Self {
            parser: Some(parser),
            name,
            next_id: settings.config.first_read_id,
            settings,
        }
    }

    fn finish(&mut self, spectrum: &mut Spectrum) {
        spectrum.read_id = self.next_id;
        self.next_id += 1;
        spectrum.source.clone_from(&self.name);
        if spectrum.tolerance.is_none() {
            spectrum.tolerance = Some(self.settings.tolerance);
        }
        if spectrum.additional_mz_offsets.is_none() {
            spectrum.additional_mz_offsets = self
                .settings
                .config
                .mz_offsets_for(spectrum.is_charge_ambiguous());
        }
    }
}

impl<P: RecordParser> PullSpectra for LeafPull<P> {
    fn pull(&mut self) -> Result<Option<Spectrum>, SourceError> {
        let Some(parser) = self.parser.as_mut() else {
            return Ok(None);
        };
        match parser.read_record()? {
            Some(mut spectrum) => {
                self.finish(&mut spectrum);
                Ok(Some(spectrum))
            }
            None => Ok(None),
        }
    }
}

/// A [`SpectraSource`] reading one flat file with the dialect `P`
pub struct LeafSource<P: RecordParser> {
    name: String,
    origin: LeafOrigin,
    settings: Arc<SourceSettings>,
    state: Lookahead<LeafPull<P>>,
}

impl<P: RecordParser> LeafSource<P> {
    /// Open the file at `path`, which may be compressed
    pub fn open_path(
        path: impl AsRef<Path>,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let path = std::path::absolute(path.as_ref())?;
        let name = path.display().to_string();
        let reader = open_path_reader(&path)?;
        Self::build(name, LeafOrigin::Path(path), reader, settings)
    }

    /// Read from an anonymous stream. The source cannot be restarted.
    pub fn from_reader(
        name: impl Into<String>,
        reader: BoxedBufRead,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        Self::build(name.into(), LeafOrigin::Stream, reader, settings)
    }

    fn build(
        name: String,
        origin: LeafOrigin,
        reader: BoxedBufRead,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let parser = P::from_reader(reader, &name, settings.clone())?;
        let state = Lookahead::primed(LeafPull::new(parser, name.clone(), settings.clone()))?;
        Ok(Self {
            name,
            origin,
            settings,
            state,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            LeafOrigin::Path(path) => Some(path),
            LeafOrigin::Stream => None,
        }
    }
}

impl<P: RecordParser> SpectraSource for LeafSource<P> {
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
        let LeafOrigin::Path(path) = &self.origin else {
            return Err(SourceError::NotRestartable(self.name.clone()));
        };
        let path = path.clone();
        debug!("Restarting {}", self.name);
        self.close();
        let reader = open_path_reader(&path)?;
        let parser = P::from_reader(reader, &self.name, self.settings.clone())?;
        self.state.reset(LeafPull::new(
            parser,
            self.name.clone(),
            self.settings.clone(),
        ))
    }

    fn can_restart(&self) -> bool {
        matches!(self.origin, LeafOrigin::Path(_))
    }

    fn close(&mut self) {
        self.state.inner_mut().parser = None;
    }

    fn count_read(&self) -> u64 {
        self.state.count_read()
    }

    fn gather_data(&mut self, _parallelism: usize) -> Result<GatherStats, SourceError> {
        ensure_restartable(self)?;
        let LeafOrigin::Path(path) = &self.origin else {
            return Err(SourceError::NotRestartable(self.name.clone()));
        };
        let start = Instant::now();
        let reader = open_path_reader(path)?;
        let stats = P::scan_stats(reader, &self.name, self.settings.clone())?;
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
        self.name.clone()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Leaf
    }
}

/// Log an unparseable numeric field and move on
pub(crate) fn warn_unparseable(field: &str, value: &str, source: &str, line: u64) {
    warn!("Could not parse {field} value {value:?} in {source} at line {line}, ignoring it");
}

/// Read one line into `buffer`, replacing bytes that are not UTF-8 (Latin-1
/// `µ` in titles, say) rather than failing the whole stream.
pub(crate) fn read_line(reader: &mut BoxedBufRead, buffer: &mut String) -> io::Result<usize> {
    let mut bytes = std::mem::take(buffer).into_bytes();
    bytes.clear();
    let n = reader.read_until(b'\n', &mut bytes)?;
    *buffer = match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    Ok(n)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::mass_error::Tolerance;

    fn policy() -> ChargePolicy {
        let settings = SourceSettings::new(Tolerance::default(), 2, ReaderConfig::default()).unwrap();
        ChargePolicy::new(&settings, 7)
    }

    #[test]
    fn test_resolve() {
        let policy = policy();
        let mut complaints = 0;
        assert_eq!(
            policy.resolve(Some(&["3+"][..]), |_| complaints += 1),
            ChargeResolution::Definite(3)
        );
        assert_eq!(
            policy.resolve(Some(&["2+", "3+"][..]), |_| complaints += 1),
            ChargeResolution::Ambiguous
        );
        assert_eq!(
            policy.resolve(Some(&[" "][..]), |_| complaints += 1),
            ChargeResolution::Ambiguous
        );
        assert_eq!(
            policy.resolve::<&str>(None, |_| complaints += 1),
            ChargeResolution::Ambiguous
        );
        assert_eq!(complaints, 0);
        assert_eq!(
            policy.resolve(Some(&["two"][..]), |_| complaints += 1),
            ChargeResolution::Definite(1)
        );
        assert_eq!(complaints, 1);
    }

    #[test]
    fn test_apply() {
        let policy = policy();
        let mut spectrum = Spectrum::default();
        assert!(!policy.apply(&mut spectrum, ChargeResolution::Definite(1)));
        assert!(policy.apply(&mut spectrum, ChargeResolution::Ambiguous));
        assert_eq!(spectrum.charge_alternatives, vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(spectrum.precursor_charge, 4);
        assert_eq!(policy.charge_for_mass(ChargeResolution::Ambiguous), Some(7));
        assert_eq!(policy.charge_for_mass(ChargeResolution::Definite(1)), None);
    }

    #[test]
    fn test_peak_lines() {
        assert_eq!(parse_peak_line("100.1 50"), Some(Some((100.1, 50.0))));
        assert_eq!(parse_peak_line("100.1\t1.5E+02"), Some(Some((100.1, 150.0))));
        assert_eq!(parse_peak_line("100.1 50 2"), Some(Some((100.1, 50.0))));
        assert_eq!(parse_peak_line("1.2.3 50"), Some(None));
        assert_eq!(parse_peak_line("CHARGE=2+"), None);
    }

    #[test]
    fn test_value_after() {
        let header = "RawFile: run_a FinneganScanNumber: 12 Elution from: 1.5 to 2.5";
        assert_eq!(value_after(header, "rawfile:").as_deref(), Some("run_a"));
        assert_eq!(value_after(header, " finneganscannumber:").as_deref(), Some("12"));
        assert_eq!(value_after(header, "elution from:").as_deref(), Some("1.5 to 2.5"));
        assert_eq!(value_after(header, "index:"), None);
        assert_eq!(
            value_after("RawFile: run 1 Index: 4", "rawfile:").as_deref(),
            Some("run 1")
        );
    }

    #[test]
    fn test_parse_charge() {
        assert_eq!(parse_charge("2+"), Some(2));
        assert_eq!(parse_charge(" 3 "), Some(3));
        assert_eq!(parse_charge("+4"), Some(4));
        assert_eq!(parse_charge("x"), None);
    }

    #[test]
    fn test_read_line_lossy() -> io::Result<()> {
        let mut reader: BoxedBufRead =
            Box::new(io::Cursor::new(b"TITLE=\xb0C run\nEND IONS".to_vec()));
        let mut buffer = String::new();
        assert_eq!(read_line(&mut reader, &mut buffer)?, 13);
        assert_eq!(buffer, "TITLE=\u{FFFD}C run\n");
        assert_eq!(read_line(&mut reader, &mut buffer)?, 8);
        assert_eq!(buffer, "END IONS");
        assert_eq!(read_line(&mut reader, &mut buffer)?, 0);
        assert!(buffer.is_empty());
        Ok(())
    }
}
