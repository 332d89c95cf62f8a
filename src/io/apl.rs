//! Read MaxQuant's `.apl` "Andromeda peak list" files.
//!
//! Each record is bracketed by `peaklist start` / `peaklist end` lines and
//! carries `mz=`, `charge=` and `header=` fields ahead of tab separated peaks.
//! The header holds the run and scan as `key: value` pairs.
use std::io;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::config::SourceSettings;
use crate::io::leaf::{
    parse_charge, parse_peak_line, read_line, value_after, warn_unparseable, BoxedBufRead,
    ChargePolicy, ChargeResolution, LeafSource, RecordParser,
};
use crate::io::traits::SourceError;
use crate::spectrum::Spectrum;

/// The highest charge assumed for APL records of unknown charge
pub const APL_MAX_CHARGE: i32 = 5;

const RECORD_START: &str = "peaklist start";
const RECORD_END: &str = "peaklist end";

/// A [`SpectraSource`](crate::io::SpectraSource) over an APL file or stream
pub type APLSource = LeafSource<APLParser>;

pub fn is_apl(buf: &[u8]) -> bool {
    let needle = RECORD_START.as_bytes();
    buf.windows(needle.len()).any(|window| window == needle)
}

/// Whether MaxQuant wrote the file for precursors it could not assign a charge to
fn names_unknown_charge_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with("peak.apl")
}

#[derive(Debug, Error)]
pub enum APLError {
    #[error("Found a peak list without a header line")]
    MissingHeader,
    #[error("Found `peaklist start` inside an unterminated peak list")]
    UnexpectedStart,
    #[error("The input ended inside an unterminated peak list")]
    Unterminated,
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

impl APLError {
    fn at_line(self, line: u64) -> SourceError {
        match self {
            APLError::IOError(e) => SourceError::Io(e),
            err => SourceError::malformed(line, err.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct RecordBuilder {
    spectrum: Spectrum,
    charge_tokens: Option<Vec<String>>,
    has_header: bool,
    unknown_charge: bool,
}

pub struct APLParser {
    handle: BoxedBufRead,
    in_record: bool,
    finished: bool,
    line_number: u64,
    name: String,
    charges: ChargePolicy,
    unknown_charge_file: bool,
    header_warning_shown: bool,
}

impl APLParser {
    pub(crate) fn new(handle: BoxedBufRead, name: &str, settings: &SourceSettings) -> Self {
        Self {
            handle,
            in_record: false,
            finished: false,
            line_number: 0,
            name: name.to_string(),
            charges: ChargePolicy::new(settings, APL_MAX_CHARGE),
            unknown_charge_file: names_unknown_charge_file(name),
            header_warning_shown: false,
        }
    }

    fn handle_header(&mut self, value: &str, builder: &mut RecordBuilder) {
        let mut header = value.trim();
        while let Some(rest) = header.strip_prefix("header=") {
            header = rest.trim();
        }
        let spectrum = &mut builder.spectrum;
        spectrum.title = header.to_string();
        builder.has_header = true;
        builder.unknown_charge = header.ends_with("_peak_");

        let first_token = |key: &str| {
            value_after(header, key).and_then(|v| v.split_whitespace().next().map(str::to_string))
        };
        spectrum.scan_number = first_token(" finneganscannumber:")
            .or_else(|| first_token(" index:"))
            .and_then(|scan| scan.parse().ok());
        spectrum.run = first_token("rawfile:").unwrap_or_default();
        if let Some(intensity) = first_token("precintensity:") {
            match intensity.parse() {
                Ok(intensity) => spectrum.precursor_intensity = intensity,
                Err(_) => warn_unparseable("precIntensity", &intensity, &self.name, self.line_number),
            }
        }
        if let Some(elution) = value_after(header, "elution from:") {
            let mut bounds = elution.split(" to ").map(|v| v.trim().parse::<f64>().ok());
            spectrum.elution_time_start = bounds.next().flatten();
            spectrum.elution_time_end = bounds.next().flatten();
        }

        if (spectrum.run.is_empty() || spectrum.scan_number.is_none()) && !self.header_warning_shown {
            self.header_warning_shown = true;
            warn!(
                "Could not find the run and scan number in the header {header:?} of {} at line {}",
                self.name, self.line_number
            );
        }
    }

    fn handle_record_line(&mut self, line: &str, builder: &mut RecordBuilder) {
        if let Some(peak) = parse_peak_line(line) {
            match peak {
                Some((mz, intensity)) => builder.spectrum.add_peak(mz, intensity),
                None => debug!("Skipping peak line {line:?} in {}", self.name),
            }
            return;
        }
        let Some((key, value)) = line.split_once('=') else {
            return;
        };
        match key.trim() {
            "mz" => match value.trim().parse() {
                Ok(mz) => builder.spectrum.precursor_mz = mz,
                Err(_) => warn_unparseable("mz", value, &self.name, self.line_number),
            },
            "charge" => {
                builder.charge_tokens =
                    Some(value.trim().split(" and ").map(str::to_string).collect());
            }
            "header" => self.handle_header(value, builder),
            _ => {}
        }
    }

    fn finish_record(&self, builder: RecordBuilder) -> Result<Option<Spectrum>, APLError> {
        if !builder.has_header {
            return Err(APLError::MissingHeader);
        }
        let RecordBuilder {
            mut spectrum,
            charge_tokens,
            unknown_charge,
            ..
        } = builder;
        let resolution = if self.unknown_charge_file || unknown_charge {
            // These files repeat every charge 3 precursor of the main peak list
            let declared = charge_tokens
                .as_deref()
                .and_then(|tokens| tokens.first())
                .and_then(|token| parse_charge(token));
            if declared == Some(3) {
                debug!("Skipping repeated charge 3 peak list {:?}", spectrum.title);
                return Ok(None);
            }
            ChargeResolution::Ambiguous
        } else {
            self.charges.resolve(charge_tokens.as_deref(), |token| {
                warn_unparseable("charge", token, &self.name, self.line_number)
            })
        };
        if self.charges.apply(&mut spectrum, resolution) {
            Ok(Some(spectrum))
        } else {
            debug!(
                "Discarding peak list {:?} with charge {} below the minimum charge",
                spectrum.title, spectrum.precursor_charge
            );
            Ok(None)
        }
    }

    /// Read the next peak list from the stream, if there is one.
    pub fn read_next(&mut self) -> Result<Option<Spectrum>, APLError> {
        let mut buffer = String::new();
        let mut builder: Option<RecordBuilder> = None;
        while !self.finished {
            let b = match read_line(&mut self.handle, &mut buffer) {
                Ok(b) => b,
                Err(err) => {
                    self.finished = true;
                    return Err(err.into());
                }
            };
            if b == 0 {
                self.finished = true;
                if self.in_record {
                    return Err(APLError::Unterminated);
                }
                break;
            }
            self.line_number += 1;
            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }
            let lowered = line.to_ascii_lowercase();

            if !self.in_record {
                if lowered.starts_with(RECORD_START) {
                    self.in_record = true;
                    builder = Some(RecordBuilder::default());
                }
                continue;
            }
            if lowered.starts_with(RECORD_START) {
                self.finished = true;
                return Err(APLError::UnexpectedStart);
            }
            if lowered.starts_with(RECORD_END) {
                self.in_record = false;
                if let Some(current) = builder.take() {
                    match self.finish_record(current) {
                        Ok(Some(spectrum)) => return Ok(Some(spectrum)),
                        Ok(None) => {}
                        Err(e) => {
                            self.finished = true;
                            return Err(e);
                        }
                    }
                }
                continue;
            }
            let current = builder.get_or_insert_with(RecordBuilder::default);
            self.handle_record_line(line, current);
        }
        Ok(None)
    }
}

impl RecordParser for APLParser {
    fn from_reader(
        reader: BoxedBufRead,
        name: &str,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        Ok(Self::new(reader, name, &settings))
    }

    fn read_record(&mut self) -> Result<Option<Spectrum>, SourceError> {
        self.read_next().map_err(|e| e.at_line(self.line_number))
    }
}
