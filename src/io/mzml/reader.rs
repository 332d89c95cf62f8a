use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use flate2::read::ZlibDecoder;
use log::{debug, trace, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use thiserror::Error;

use crate::config::SourceSettings;
use crate::io::compression::strip_compression_extension;
use crate::io::leaf::{BoxedBufRead, ChargePolicy, RecordParser};
use crate::io::traits::SourceError;
use crate::spectrum::Spectrum;

/// The highest charge assumed for mzML spectra of unknown charge
pub const MZML_MAX_CHARGE: i32 = 7;

static SCAN_IN_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"scan=(\d+)").unwrap());

const MS_LEVEL: &str = "MS:1000511";
const SCAN_START_TIME: &str = "MS:1000016";
const SELECTED_ION_MZ: &str = "MS:1000744";
const CHARGE_STATE: &str = "MS:1000041";
const POSSIBLE_CHARGE_STATE: &str = "MS:1000633";
const PEAK_INTENSITY: &str = "MS:1000042";
const MZ_ARRAY: &str = "MS:1000514";
const INTENSITY_ARRAY: &str = "MS:1000515";
const FLOAT_32: &str = "MS:1000521";
const FLOAT_64: &str = "MS:1000523";
const INT_32: &str = "MS:1000519";
const INT_64: &str = "MS:1000522";
const ZLIB_COMPRESSION: &str = "MS:1000574";
const NO_COMPRESSION: &str = "MS:1000576";
const UNIT_MINUTE: &str = "UO:0000031";

#[derive(Debug, Error)]
pub enum MzMLError {
    #[error("Encountered an XML error: {0}")]
    XMLError(#[from] quick_xml::Error),
    #[error("Failed to decode a base64 array: {0}")]
    Base64Error(String),
    #[error("Unsupported binary array encoding {0}")]
    UnsupportedEncoding(String),
    #[error("The binary array is {0} bytes long, not a multiple of its {1} byte width")]
    ArrayWidthMismatch(usize, usize),
    #[error("The m/z and intensity arrays differ in length ({0} and {1})")]
    ArrayLengthMismatch(usize, usize),
    #[error("The document ended inside a spectrum")]
    Unterminated,
    #[error("Encountered an IO error: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

impl From<quick_xml::events::attributes::AttrError> for MzMLError {
    fn from(value: quick_xml::events::attributes::AttrError) -> Self {
        Self::XMLError(value.into())
    }
}

impl MzMLError {
    fn at_line(self, line: u64) -> SourceError {
        match self {
            MzMLError::IOError(e) => SourceError::Io(e),
            err => SourceError::malformed(line, err.to_string()),
        }
    }
}

/// Counts the newlines the XML reader has consumed so errors can name a line
struct LineCounter<R> {
    inner: R,
    lines: u64,
}

impl<R: BufRead> Read for LineCounter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.lines += bytecount(&buf[..n]);
        Ok(n)
    }
}

impl<R: BufRead> BufRead for LineCounter<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        if let Ok(buf) = self.inner.fill_buf() {
            let amt = amt.min(buf.len());
            self.lines += bytecount(&buf[..amt]);
        }
        self.inner.consume(amt)
    }
}

fn bytecount(buf: &[u8]) -> u64 {
    buf.iter().filter(|b| **b == b'\n').count() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    MZ,
    Intensity,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumberType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl NumberType {
    fn width(&self) -> usize {
        match self {
            NumberType::Float32 | NumberType::Int32 => 4,
            NumberType::Float64 | NumberType::Int64 => 8,
        }
    }
}

#[derive(Debug)]
struct ArrayBuilder {
    kind: ArrayKind,
    dtype: NumberType,
    zlib: bool,
    unsupported: Option<String>,
    text: String,
}

impl Default for ArrayBuilder {
    fn default() -> Self {
        Self {
            kind: ArrayKind::Other,
            dtype: NumberType::Float64,
            zlib: false,
            unsupported: None,
            text: String::new(),
        }
    }
}

impl ArrayBuilder {
    fn decode(&self) -> Result<Vec<f64>, MzMLError> {
        if let Some(encoding) = &self.unsupported {
            return Err(MzMLError::UnsupportedEncoding(encoding.clone()));
        }
        let raw = base64_simd::STANDARD
            .decode_to_vec(self.text.trim().as_bytes())
            .map_err(|e| MzMLError::Base64Error(e.to_string()))?;
        let bytes = if self.zlib && !raw.is_empty() {
            let mut out = Vec::new();
            ZlibDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
            out
        } else {
            raw
        };
        let width = self.dtype.width();
        if bytes.len() % width != 0 {
            return Err(MzMLError::ArrayWidthMismatch(bytes.len(), width));
        }
        let values = match self.dtype {
            NumberType::Float64 => bytemuck::pod_collect_to_vec::<u8, f64>(&bytes),
            NumberType::Float32 => bytemuck::pod_collect_to_vec::<u8, f32>(&bytes)
                .into_iter()
                .map(f64::from)
                .collect(),
            NumberType::Int32 => bytemuck::pod_collect_to_vec::<u8, i32>(&bytes)
                .into_iter()
                .map(f64::from)
                .collect(),
            NumberType::Int64 => bytemuck::pod_collect_to_vec::<u8, i64>(&bytes)
                .into_iter()
                .map(|v| v as f64)
                .collect(),
        };
        Ok(values)
    }
}

#[derive(Debug, Default)]
struct SpectrumBuilder {
    id: String,
    index: Option<u64>,
    ms_level: Option<u8>,
    scan_start: Option<f64>,
    precursor_mz: Option<f64>,
    precursor_intensity: Option<f64>,
    charge_tokens: Vec<String>,
    selected_ions: usize,
    in_selected_ion: bool,
    array: Option<ArrayBuilder>,
    in_binary: bool,
    mz_array: Option<Vec<f64>>,
    intensity_array: Option<Vec<f64>>,
}

impl SpectrumBuilder {
    fn in_first_selected_ion(&self) -> bool {
        self.in_selected_ion && self.selected_ions == 1
    }

    fn fill_param(&mut self, accession: &str, value: &str, unit: Option<&str>) {
        if let Some(array) = self.array.as_mut() {
            match accession {
                MZ_ARRAY => array.kind = ArrayKind::MZ,
                INTENSITY_ARRAY => array.kind = ArrayKind::Intensity,
                FLOAT_64 => array.dtype = NumberType::Float64,
                FLOAT_32 => array.dtype = NumberType::Float32,
                INT_32 => array.dtype = NumberType::Int32,
                INT_64 => array.dtype = NumberType::Int64,
                ZLIB_COMPRESSION => array.zlib = true,
                NO_COMPRESSION => array.zlib = false,
                // MS-Numpress and its zlib combinations
                "MS:1002312" | "MS:1002313" | "MS:1002314" | "MS:1002746" | "MS:1002747"
                | "MS:1002748" => array.unsupported = Some(accession.to_string()),
                _ => {}
            }
            return;
        }
        match accession {
            MS_LEVEL => self.ms_level = value.parse().ok(),
            SCAN_START_TIME if self.scan_start.is_none() => {
                self.scan_start = value.parse::<f64>().ok().map(|time| {
                    if unit.is_some_and(|u| u == UNIT_MINUTE || u == "minute") {
                        time * 60.0
                    } else {
                        time
                    }
                });
            }
            SELECTED_ION_MZ if self.in_first_selected_ion() => {
                self.precursor_mz = value.parse().ok()
            }
            PEAK_INTENSITY if self.in_first_selected_ion() => {
                self.precursor_intensity = value.parse().ok()
            }
            CHARGE_STATE | POSSIBLE_CHARGE_STATE if self.in_first_selected_ion() => {
                self.charge_tokens.push(value.to_string())
            }
            _ => {}
        }
    }
}

fn attribute(event: &BytesStart, key: &[u8]) -> Result<Option<String>, MzMLError> {
    for attr in event.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// A streaming parser over the `<spectrum>` elements of an mzML document,
/// emitting MS2 spectra only.
pub struct MzMLParser {
    reader: Reader<LineCounter<BoxedBufRead>>,
    current: Option<SpectrumBuilder>,
    finished: bool,
    name: String,
    run: String,
    charges: ChargePolicy,
    charge_warning_shown: bool,
}

impl MzMLParser {
    pub(crate) fn new(handle: BoxedBufRead, name: &str, settings: &SourceSettings) -> Self {
        let mut reader = Reader::from_reader(LineCounter {
            inner: handle,
            lines: 0,
        });
        reader.trim_text(true);
        let (_, plain) = strip_compression_extension(name);
        let run = Path::new(plain)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            reader,
            current: None,
            finished: false,
            name: name.to_string(),
            run,
            charges: ChargePolicy::new(settings, MZML_MAX_CHARGE),
            charge_warning_shown: false,
        }
    }

    fn line_number(&self) -> u64 {
        self.reader.get_ref().lines + 1
    }

    fn start_element(&mut self, event: &BytesStart, is_empty: bool) -> Result<(), MzMLError> {
        let name = event.local_name();
        if name.as_ref() == b"spectrum" {
            let index = attribute(event, b"index")?.and_then(|v| v.parse().ok());
            self.current = Some(SpectrumBuilder {
                id: attribute(event, b"id")?.unwrap_or_default(),
                index,
                ..Default::default()
            });
            return Ok(());
        }
        let Some(builder) = self.current.as_mut() else {
            return Ok(());
        };
        match name.as_ref() {
            b"cvParam" => {
                let accession = attribute(event, b"accession")?.unwrap_or_default();
                let value = attribute(event, b"value")?.unwrap_or_default();
                let unit = match attribute(event, b"unitAccession")? {
                    Some(unit) => Some(unit),
                    None => attribute(event, b"unitName")?,
                };
                builder.fill_param(&accession, &value, unit.as_deref());
            }
            b"selectedIon" => {
                builder.selected_ions += 1;
                builder.in_selected_ion = !is_empty;
            }
            b"binaryDataArray" => builder.array = Some(ArrayBuilder::default()),
            b"binary" => builder.in_binary = !is_empty,
            _ => {}
        }
        Ok(())
    }

    fn end_element(&mut self, name: &[u8]) -> Result<Option<Spectrum>, MzMLError> {
        if name == b"spectrum" {
            return match self.current.take() {
                Some(builder) => self.finish_spectrum(builder),
                None => Ok(None),
            };
        }
        let Some(builder) = self.current.as_mut() else {
            return Ok(None);
        };
        match name {
            b"selectedIon" => builder.in_selected_ion = false,
            b"binary" => builder.in_binary = false,
            b"binaryDataArray" => {
                if let Some(array) = builder.array.take() {
                    match array.kind {
                        ArrayKind::MZ => builder.mz_array = Some(array.decode()?),
                        ArrayKind::Intensity => builder.intensity_array = Some(array.decode()?),
                        ArrayKind::Other => {}
                    }
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn finish_spectrum(&mut self, builder: SpectrumBuilder) -> Result<Option<Spectrum>, MzMLError> {
        if builder.ms_level != Some(2) {
            trace!("Skipping spectrum {} at MS level {:?}", builder.id, builder.ms_level);
            return Ok(None);
        }
        let mz_array = builder.mz_array.unwrap_or_default();
        let intensity_array = builder.intensity_array.unwrap_or_default();
        if mz_array.len() != intensity_array.len() {
            return Err(MzMLError::ArrayLengthMismatch(
                mz_array.len(),
                intensity_array.len(),
            ));
        }

        let mut spectrum = Spectrum::default();
        for (mz, intensity) in mz_array.into_iter().zip(intensity_array) {
            spectrum.add_peak(mz, intensity);
        }
        spectrum.precursor_mz = builder.precursor_mz.unwrap_or_default();
        spectrum.precursor_intensity = builder.precursor_intensity.unwrap_or_default();
        spectrum.scan_number = SCAN_IN_ID
            .captures(&builder.id)
            .and_then(|caps| caps[1].parse().ok())
            .or(builder.index);
        spectrum.title = builder.id;
        spectrum.run.clone_from(&self.run);
        spectrum.elution_time_start = builder.scan_start;

        let tokens = (!builder.charge_tokens.is_empty()).then_some(&builder.charge_tokens[..]);
        let mut unparseable = None;
        let resolution = self
            .charges
            .resolve(tokens, |token| unparseable = Some(token.to_string()));
        if let Some(token) = unparseable {
            if !self.charge_warning_shown {
                self.charge_warning_shown = true;
                warn!(
                    "Unknown charge state ({token}) in spectrum {} of {}, assuming charge state 1",
                    spectrum.title, self.name
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

    /// Read the next MS2 spectrum from the document, if there is one.
    pub fn read_next(&mut self) -> Result<Option<Spectrum>, MzMLError> {
        let mut buffer = Vec::new();
        while !self.finished {
            buffer.clear();
            let event = match self.reader.read_event_into(&mut buffer) {
                Ok(event) => event,
                Err(err) => {
                    self.finished = true;
                    return Err(err.into());
                }
            };
            let outcome = match event {
                Event::Start(ref e) => self.start_element(e, false).map(|_| None),
                Event::Empty(ref e) => self.start_element(e, true).map(|_| None),
                Event::End(ref e) => self.end_element(e.local_name().as_ref()),
                Event::Text(ref e) => {
                    match self.current.as_mut().filter(|b| b.in_binary) {
                        Some(builder) => match (builder.array.as_mut(), e.unescape()) {
                            (Some(array), Ok(text)) => {
                                array.text.push_str(&text);
                                Ok(None)
                            }
                            (_, Err(err)) => Err(err.into()),
                            (None, Ok(_)) => Ok(None),
                        },
                        None => Ok(None),
                    }
                }
                Event::Eof => {
                    self.finished = true;
                    if self.current.take().is_some() {
                        return Err(MzMLError::Unterminated);
                    }
                    Ok(None)
                }
                _ => Ok(None),
            };
            match outcome {
                Ok(Some(spectrum)) => return Ok(Some(spectrum)),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }
}

impl RecordParser for MzMLParser {
    fn from_reader(
        reader: BoxedBufRead,
        name: &str,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        Ok(Self::new(reader, name, &settings))
    }

    fn read_record(&mut self) -> Result<Option<Spectrum>, SourceError> {
        self.read_next().map_err(|e| e.at_line(self.line_number()))
    }
}
