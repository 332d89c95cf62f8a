//! Reader configuration.
//!
//! [`ReaderConfig`] is the already-materialized set of user overrides the
//! readers consult: a title grammar, the charge range to assume when a file
//! does not state one, extra precursor m/z offsets and the archive safety
//! limit. Loading it from a file is the caller's business; this module only
//! offers [`ReaderConfig::from_key_values`] over a simple key lookup.
use std::sync::Arc;

use log::debug;
use regex::{Regex, RegexBuilder};

use crate::io::SourceError;
use crate::mass_error::Tolerance;
use crate::utils::missing_isotope_offsets;

pub const DEFAULT_CHARGE: i32 = 4;
pub const DEFAULT_MAX_COMPRESSION_RATIO: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReaderConfig {
    /// A pattern whose first group extracts the run name from a `TITLE=` line
    pub run_pattern: Option<String>,
    /// A pattern whose first group extracts the scan number from a `TITLE=` line
    pub scan_pattern: Option<String>,
    /// The largest charge assumed for spectra of unknown charge. Each dialect
    /// has its own default when this is unset.
    pub max_charge: Option<i32>,
    /// The placeholder charge spectra of unknown charge are emitted under
    pub default_charge: i32,
    pub additional_mz_offsets: Option<Vec<f64>>,
    /// Offsets added on top of [`ReaderConfig::additional_mz_offsets`] for spectra of unknown charge
    pub unknown_charge_mz_offsets: Option<Vec<f64>>,
    /// Archive entries declaring a larger uncompressed/compressed ratio are rejected
    pub max_compression_ratio: f64,
    /// The `read_id` the first spectrum of each leaf file receives
    pub first_read_id: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            run_pattern: None,
            scan_pattern: None,
            max_charge: None,
            default_charge: DEFAULT_CHARGE,
            additional_mz_offsets: None,
            unknown_charge_mz_offsets: None,
            max_compression_ratio: DEFAULT_MAX_COMPRESSION_RATIO,
            first_read_id: 0,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SourceError> {
    value
        .trim()
        .parse()
        .map_err(|_| SourceError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}

fn parse_offsets(key: &str, value: &str) -> Result<Vec<f64>, SourceError> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse_value(key, v))
        .collect()
}

impl ReaderConfig {
    pub fn with_title_patterns(mut self, run_pattern: &str, scan_pattern: &str) -> Self {
        self.run_pattern = Some(run_pattern.to_string());
        self.scan_pattern = Some(scan_pattern.to_string());
        self
    }

    pub fn with_max_charge(mut self, max_charge: i32) -> Self {
        self.max_charge = Some(max_charge);
        self
    }

    pub fn with_default_charge(mut self, default_charge: i32) -> Self {
        self.default_charge = default_charge;
        self
    }

    pub fn with_additional_mz_offsets(mut self, offsets: Vec<f64>) -> Self {
        self.additional_mz_offsets = Some(offsets);
        self
    }

    pub fn with_unknown_charge_mz_offsets(mut self, offsets: Vec<f64>) -> Self {
        self.unknown_charge_mz_offsets = Some(offsets);
        self
    }

    /// Also try precursors up to `count` C13 isotope peaks below the reported one
    pub fn with_missing_isotope_peaks(self, count: u32) -> Self {
        self.with_additional_mz_offsets(missing_isotope_offsets(count))
    }

    /// Like [`ReaderConfig::with_missing_isotope_peaks`], but only for spectra of unknown charge
    pub fn with_missing_isotope_peaks_unknown_charge(self, count: u32) -> Self {
        self.with_unknown_charge_mz_offsets(missing_isotope_offsets(count))
    }

    pub fn with_max_compression_ratio(mut self, ratio: f64) -> Self {
        self.max_compression_ratio = ratio;
        self
    }

    pub fn with_first_read_id(mut self, first_read_id: u64) -> Self {
        self.first_read_id = first_read_id;
        self
    }

    /// Build a configuration from `KEY` / value pairs. Keys are matched
    /// case-insensitively and unknown keys are ignored.
    pub fn from_key_values<I, K, V>(pairs: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref().trim().to_uppercase();
            let value = value.as_ref();
            match key.as_str() {
                "RUN_RE" => config.run_pattern = Some(value.to_string()),
                "SCAN_RE" => config.scan_pattern = Some(value.to_string()),
                "MAX_CHARGE" => config.max_charge = Some(parse_value(&key, value)?),
                "DEFAULT_CHARGE" => config.default_charge = parse_value(&key, value)?,
                "MISSING_ISOTOPE_PEAKS" => {
                    config.additional_mz_offsets =
                        Some(missing_isotope_offsets(parse_value(&key, value)?))
                }
                "MISSING_ISOTOPE_PEAKS_UNKNOWN_CHARGE" => {
                    config.unknown_charge_mz_offsets =
                        Some(missing_isotope_offsets(parse_value(&key, value)?))
                }
                "ADDITIONAL_MZ_OFFSETS" => {
                    config.additional_mz_offsets = Some(parse_offsets(&key, value)?)
                }
                "UNKNOWN_CHARGE_MZ_OFFSETS" => {
                    config.unknown_charge_mz_offsets = Some(parse_offsets(&key, value)?)
                }
                "MAX_COMPRESSION_RATIO" => {
                    config.max_compression_ratio = parse_value(&key, value)?
                }
                "FIRST_READ_ID" => config.first_read_id = parse_value(&key, value)?,
                _ => {
                    debug!("Ignoring unrelated configuration key {key}");
                }
            }
        }
        Ok(config)
    }

    /// The m/z offsets a spectrum that did not declare its own should carry
    pub fn mz_offsets_for(&self, charge_ambiguous: bool) -> Option<Vec<f64>> {
        if !charge_ambiguous {
            return self.additional_mz_offsets.clone();
        }
        match (&self.additional_mz_offsets, &self.unknown_charge_mz_offsets) {
            (None, None) => None,
            (base, extra) => {
                let mut offsets: Vec<f64> = Vec::new();
                for value in base.iter().flatten().chain(extra.iter().flatten()) {
                    if !offsets.iter().any(|v| v.to_bits() == value.to_bits()) {
                        offsets.push(*value);
                    }
                }
                Some(offsets)
            }
        }
    }
}

/// A user-supplied run/scan title grammar, compiled.
#[derive(Debug, Clone)]
pub(crate) struct UserTitlePattern {
    pub(crate) run: Regex,
    pub(crate) scan: Regex,
}

fn compile_anchored(key: &str, pattern: &str) -> Result<Regex, SourceError> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(true)
        .build()
        .map_err(|e| SourceError::InvalidConfig(format!("{key}: {e}")))
}

/// Everything a reader needs to know besides its input. Shared by every
/// source of one tree.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub tolerance: Tolerance,
    pub min_charge: i32,
    pub config: ReaderConfig,
    pub(crate) user_title: Option<UserTitlePattern>,
}

impl SourceSettings {
    pub fn new(
        tolerance: Tolerance,
        min_charge: i32,
        config: ReaderConfig,
    ) -> Result<Self, SourceError> {
        let user_title = match (&config.run_pattern, &config.scan_pattern) {
            (Some(run), Some(scan)) => Some(UserTitlePattern {
                run: compile_anchored("RUN_RE", run)?,
                scan: compile_anchored("SCAN_RE", scan)?,
            }),
            (None, None) => None,
            _ => {
                return Err(SourceError::InvalidConfig(
                    "RUN_RE and SCAN_RE must be given together".to_string(),
                ))
            }
        };
        Ok(Self {
            tolerance,
            min_charge,
            config,
            user_title,
        })
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::C13_MASS_DIFFERENCE;

    #[test]
    fn test_from_key_values() -> Result<(), SourceError> {
        let config = ReaderConfig::from_key_values([
            ("run_re", r"TITLE=(\w+)\..*"),
            ("SCAN_RE", r"TITLE=\w+\.(\d+)"),
            ("MISSING_ISOTOPE_PEAKS", "1"),
            ("MISSING_ISOTOPE_PEAKS_UNKNOWN_CHARGE", "2"),
            ("MAX_COMPRESSION_RATIO", "50"),
            ("SOMETHING_ELSE", "whatever"),
        ])?;
        assert_eq!(config.run_pattern.as_deref(), Some(r"TITLE=(\w+)\..*"));
        assert_eq!(config.max_compression_ratio, 50.0);
        assert_eq!(config.mz_offsets_for(false).unwrap().len(), 1);
        let broad = config.mz_offsets_for(true).unwrap();
        assert_eq!(broad.len(), 2);
        assert!((broad[1] + 2.0 * C13_MASS_DIFFERENCE).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ReaderConfig::from_key_values([("MAX_CHARGE", "seven")]),
            Err(SourceError::InvalidConfig(_))
        ));
        let config = ReaderConfig::default().with_title_patterns("TITLE=(", "TITLE=(\\d+)");
        assert!(SourceSettings::new(Tolerance::default(), 1, config).is_err());
        let config = ReaderConfig {
            run_pattern: Some("TITLE=(.*)".into()),
            ..Default::default()
        };
        assert!(SourceSettings::new(Tolerance::default(), 1, config).is_err());
    }
}
