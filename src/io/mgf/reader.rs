use std::io;
use std::sync::{Arc, LazyLock};

use log::{debug, warn};
use regex::Regex;
use thiserror::Error;

use crate::config::SourceSettings;
use crate::io::leaf::{
    parse_charge, parse_peak_line, read_line, warn_unparseable, BoxedBufRead, ChargePolicy, RecordParser,
};
use crate::io::traits::{GatherStats, SourceError};
use crate::spectrum::Spectrum;
use crate::utils::neutral_mass;

use super::title::TitleParser;

/// The largest charge assumed for MGF records that do not declare one
pub const MGF_MAX_CHARGE: i32 = 7;

static RT_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*(?:[-,;]\s*([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?))?$",
    )
    .unwrap()
});

static CHARGE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" and | or ").unwrap());

static LIST_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" and | or |;").unwrap());

static MATCH_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":?matchgroup:").unwrap());

static GATHER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:CHARGE=(.*)|PEPMASS=(.*)|(BEGIN|END) IONS.*|(TITLE)=.*)$").unwrap()
});

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum MGFParserState {
    /// Between records
    Idle,
    /// Accumulating the fields and peaks of a record
    InRecord,
    Done,
    Error,
}

#[derive(Debug, Error)]
pub enum MGFError {
    #[error("Found a spectrum without a TITLE line")]
    MissingTitle,
    #[error("Found END IONS outside of a spectrum")]
    UnexpectedEnd,
    #[error("Found BEGIN IONS inside an unterminated spectrum")]
    UnexpectedBegin,
    #[error("The input ended inside an unterminated spectrum")]
    Unterminated,
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

impl MGFError {
    fn at_line(self, line: u64) -> SourceError {
        match self {
            MGFError::IOError(e) => SourceError::Io(e),
            err => SourceError::malformed(line, err.to_string()),
        }
    }
}

/// Split a `CHARGE=` value into its alternatives
fn split_charge_tokens(value: &str) -> Vec<String> {
    CHARGE_SEPARATOR
        .split(value)
        .map(|token| token.to_string())
        .collect()
}

#[derive(Debug, Default)]
struct SpectrumBuilder {
    spectrum: Spectrum,
    charge_tokens: Option<Vec<String>>,
    has_title: bool,
    /// A `SCANS=` line was seen, which takes precedence over the title
    has_scans: bool,
}

/// A parser for the generic `BEGIN IONS` / `END IONS` peak list dialect
pub struct MGFParser {
    handle: BoxedBufRead,
    pub state: MGFParserState,
    line_number: u64,
    name: String,
    charges: ChargePolicy,
    titles: TitleParser,
    charge_warning_shown: bool,
}

impl MGFParser {
    pub(crate) fn new(handle: BoxedBufRead, name: &str, settings: &SourceSettings) -> Self {
        Self {
            handle,
            state: MGFParserState::Idle,
            line_number: 0,
            name: name.to_string(),
            charges: ChargePolicy::new(settings, MGF_MAX_CHARGE),
            titles: TitleParser::new(settings.user_title.clone()),
            charge_warning_shown: false,
        }
    }

    fn warn_field(&self, field: &str, value: &str) {
        warn_unparseable(field, value, &self.name, self.line_number);
    }

    fn parse_f64_list(&self, field: &str, value: &str, separator: &Regex) -> Vec<f64> {
        separator
            .split(value)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .filter_map(|v| match v.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    self.warn_field(field, v);
                    None
                }
            })
            .collect()
    }

    fn handle_title(&mut self, line: &str, value: &str, builder: &mut SpectrumBuilder) {
        let info = self.titles.parse(line, &self.name, self.line_number);
        let spectrum = &mut builder.spectrum;
        spectrum.title = value.to_string();
        spectrum.run = info.run.unwrap_or_default();
        if !builder.has_scans {
            spectrum.scan_number = info.scan;
        }
        spectrum.title_charge = info.charge;
        if let Some(intensity) = info.precursor_intensity {
            spectrum.precursor_intensity = intensity;
        }
        if info.elution_start.is_some() {
            spectrum.elution_time_start = info.elution_start;
        }
        if info.elution_end.is_some() {
            spectrum.elution_time_end = info.elution_end;
        }
        builder.has_title = true;
    }

    fn handle_pepmass(&self, value: &str, spectrum: &mut Spectrum) {
        let mut parts = value.split_whitespace();
        match parts.next().map(|mz| (mz, mz.parse::<f64>())) {
            Some((_, Ok(mz))) => spectrum.precursor_mz = mz,
            Some((mz, Err(_))) => self.warn_field("PEPMASS", mz),
            None => self.warn_field("PEPMASS", value),
        }
        if let Some(intensity) = parts.next() {
            match intensity.parse() {
                Ok(intensity) => spectrum.precursor_intensity = intensity,
                Err(_) => self.warn_field("PEPMASS intensity", intensity),
            }
        }
    }

    fn handle_retention_time(&self, value: &str, spectrum: &mut Spectrum) {
        let Some(caps) = RT_PAIR.captures(value) else {
            self.warn_field("RTINSECONDS", value);
            return;
        };
        spectrum.elution_time_start = caps.get(1).and_then(|m| m.as_str().parse().ok());
        if let Some(end) = caps.get(2) {
            spectrum.elution_time_end = end.as_str().parse().ok();
        }
    }

    /// Interpret one line inside a record
    fn handle_record_line(&mut self, line: &str, builder: &mut SpectrumBuilder) {
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
        let value = value.trim();
        match key {
            "TITLE" => self.handle_title(line, value, builder),
            "PEPMASS" => self.handle_pepmass(value, &mut builder.spectrum),
            "CHARGE" => builder.charge_tokens = Some(split_charge_tokens(value)),
            "XLPEPMASSES" => {
                let masses = value
                    .split([';', ',', ' '])
                    .filter(|v| !v.is_empty())
                    .filter_map(|v| v.parse().ok())
                    .collect();
                builder.spectrum.peptide_candidate_masses = Some(masses);
            }
            "ADDITIONALCHARGES" => {
                let mut charges: Vec<i32> = Vec::new();
                for token in LIST_SEPARATOR.split(value).map(str::trim) {
                    if token.is_empty() {
                        continue;
                    }
                    match parse_charge(token) {
                        Some(z) if !charges.contains(&z) => charges.push(z),
                        Some(_) => {}
                        None => self.warn_field("ADDITIONALCHARGES", token),
                    }
                }
                builder.spectrum.additional_charges = Some(charges);
            }
            "ADDITIONALMZ" => {
                let offsets = self.parse_f64_list("ADDITIONALMZ", value, &LIST_SEPARATOR);
                builder.spectrum.additional_mz_offsets = Some(offsets);
            }
            "SCANS" => {
                let first = value
                    .split(['=', ' ', ',', ';', '-'])
                    .find(|v| !v.is_empty());
                match first.map(|v| v.parse::<u64>()) {
                    Some(Ok(scan)) => {
                        builder.spectrum.scan_number = Some(scan);
                        builder.has_scans = true;
                    }
                    _ => self.warn_field("SCANS", value),
                }
            }
            "RTINSECONDS" => self.handle_retention_time(value, &mut builder.spectrum),
            "PEPTIDEMATCHES" => {
                let lowered = value.to_lowercase();
                builder.spectrum.preliminary_matches.extend(
                    MATCH_GROUP
                        .split(&lowered)
                        .filter(|m| !m.is_empty())
                        .map(|m| m.to_string()),
                );
            }
            _ => {}
        }
    }

    /// Resolve the charge of a completed record, returning it if it should be emitted
    fn finish_record(&mut self, builder: SpectrumBuilder) -> Result<Option<Spectrum>, MGFError> {
        if !builder.has_title {
            return Err(MGFError::MissingTitle);
        }
        let SpectrumBuilder {
            mut spectrum,
            charge_tokens,
            ..
        } = builder;
        let mut unparseable = None;
        let resolution = self
            .charges
            .resolve(charge_tokens.as_deref(), |token| unparseable = Some(token.to_string()));
        if let Some(token) = unparseable {
            if !self.charge_warning_shown {
                self.charge_warning_shown = true;
                warn!(
                    "Unknown charge state ({token}) while reading spectra from {} at line {}, assuming charge state 1",
                    self.name, self.line_number
                );
            }
        }
        if self.charges.apply(&mut spectrum, resolution) {
            Ok(Some(spectrum))
        } else {
            debug!(
                "Discarding spectrum {:?} with charge {} below the minimum charge",
                spectrum.title, spectrum.precursor_charge
            );
            Ok(None)
        }
    }

    /// Read the next spectrum from the stream, if there is one.
    pub fn read_next(&mut self) -> Result<Option<Spectrum>, MGFError> {
        let mut buffer = String::new();
        let mut builder: Option<SpectrumBuilder> = None;
        loop {
            if matches!(self.state, MGFParserState::Done | MGFParserState::Error) {
                return Ok(None);
            }
            let b = match read_line(&mut self.handle, &mut buffer) {
                Ok(b) => b,
                Err(err) => {
                    self.state = MGFParserState::Error;
                    return Err(MGFError::IOError(err));
                }
            };
            if b == 0 {
                let unterminated = self.state == MGFParserState::InRecord;
                self.state = MGFParserState::Done;
                if unterminated {
                    return Err(MGFError::Unterminated);
                }
                return Ok(None);
            }
            self.line_number += 1;
            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }

            match self.state {
                MGFParserState::Idle => {
                    if line.starts_with("BEGIN IONS") {
                        self.state = MGFParserState::InRecord;
                        builder = Some(SpectrumBuilder::default());
                    } else if line.starts_with("END IONS") {
                        self.state = MGFParserState::Error;
                        return Err(MGFError::UnexpectedEnd);
                    }
                }
                MGFParserState::InRecord => {
                    let Some(current) = builder.as_mut() else {
                        self.state = MGFParserState::Error;
                        return Err(MGFError::Unterminated);
                    };
                    if line.starts_with("END IONS") {
                        self.state = MGFParserState::Idle;
                        if let Some(current) = builder.take() {
                            match self.finish_record(current) {
                                Ok(Some(spectrum)) => return Ok(Some(spectrum)),
                                Ok(None) => {}
                                Err(e) => {
                                    self.state = MGFParserState::Error;
                                    return Err(e);
                                }
                            }
                        }
                    } else if line.starts_with("BEGIN IONS") {
                        self.state = MGFParserState::Error;
                        return Err(MGFError::UnexpectedBegin);
                    } else {
                        self.handle_record_line(line, current);
                    }
                }
                MGFParserState::Done | MGFParserState::Error => return Ok(None),
            }
        }
    }
}

impl RecordParser for MGFParser {
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

    /// Only looks at `TITLE=`, `CHARGE=`, `PEPMASS=` and record boundary lines,
    /// without building spectra. Structural errors are reported as a full pass
    /// would report them.
    fn scan_stats(
        mut reader: BoxedBufRead,
        _name: &str,
        settings: Arc<SourceSettings>,
    ) -> Result<GatherStats, SourceError> {
        let charges = ChargePolicy::new(&settings, MGF_MAX_CHARGE);
        let mut stats = GatherStats::default();
        let mut buffer = String::new();
        let mut line_number = 0u64;
        let mut in_record = false;
        let mut has_title = false;
        let mut precursor_mz = 0.0;
        let mut charge_tokens: Option<Vec<String>> = None;

        while read_line(&mut reader, &mut buffer)? > 0 {
            line_number += 1;
            let Some(caps) = GATHER_LINE.captures(buffer.trim()) else {
                continue;
            };
            if !in_record {
                match caps.get(3).map(|m| m.as_str()) {
                    Some("BEGIN") => {
                        in_record = true;
                        has_title = false;
                        precursor_mz = 0.0;
                        charge_tokens = None;
                    }
                    Some(_) => return Err(MGFError::UnexpectedEnd.at_line(line_number)),
                    None => {}
                }
                continue;
            }
            if let Some(charge) = caps.get(1) {
                charge_tokens = Some(split_charge_tokens(charge.as_str().trim()));
            } else if let Some(pepmass) = caps.get(2) {
                precursor_mz = pepmass
                    .as_str()
                    .split_whitespace()
                    .next()
                    .and_then(|mz| mz.parse().ok())
                    .unwrap_or(0.0);
            } else if caps.get(4).is_some() {
                has_title = true;
            } else if caps.get(3).is_some_and(|m| m.as_str() == "END") {
                if !has_title {
                    return Err(MGFError::MissingTitle.at_line(line_number));
                }
                let resolution = charges.resolve(charge_tokens.as_deref(), |_| {});
                if let Some(z) = charges.charge_for_mass(resolution) {
                    stats.observe_mass(neutral_mass(precursor_mz, z));
                }
                in_record = false;
            } else {
                return Err(MGFError::UnexpectedBegin.at_line(line_number));
            }
        }
        if in_record {
            return Err(MGFError::Unterminated.at_line(line_number));
        }
        Ok(stats)
    }
}
