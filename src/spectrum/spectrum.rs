//! The record type every spectra source produces.
//!
//! A [`Spectrum`] is one tandem mass spectrum to be matched: a precursor
//! description, its fragment [`PeakSet`] and where it came from. When the
//! producing file did not state a definite precursor charge, the spectrum
//! carries the whole range of candidate charges in
//! [`Spectrum::charge_alternatives`] and the consumer tries each in turn.
use std::fmt;

use crate::mass_error::Tolerance;
use crate::peaks::{PeakSet, SpectraPeak};
use crate::utils::neutral_mass;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Spectrum {
    pub peaks: PeakSet,
    pub precursor_mz: f64,
    pub precursor_intensity: f64,
    /// The single charge this record is emitted under. A placeholder
    /// when [`Spectrum::is_charge_ambiguous`] is true.
    pub precursor_charge: i32,
    /// Every charge state this scan could represent, never empty
    pub charge_alternatives: Vec<i32>,
    /// Extra precursor m/z offsets to also try
    pub additional_mz_offsets: Option<Vec<f64>>,
    /// Extra precursor charges to also try
    pub additional_charges: Option<Vec<i32>>,
    /// Crosslinked peptide candidate masses declared by the producer
    pub peptide_candidate_masses: Option<Vec<f64>>,
    /// Unparsed peptide match hints declared by the producer
    pub preliminary_matches: Vec<String>,
    /// A charge state recovered from the title text, kept for reference only
    pub title_charge: Option<i32>,
    pub title: String,
    pub run: String,
    pub scan_number: Option<u64>,
    /// Elution start time in seconds
    pub elution_time_start: Option<f64>,
    /// Elution end time in seconds
    pub elution_time_end: Option<f64>,
    /// The `->` separated trail of sources this spectrum was read through
    pub source: String,
    pub read_id: u64,
    pub tolerance: Option<Tolerance>,
}

impl Default for Spectrum {
    fn default() -> Self {
        Self {
            peaks: PeakSet::empty(),
            precursor_mz: 0.0,
            precursor_intensity: 0.0,
            precursor_charge: 0,
            charge_alternatives: Vec::new(),
            additional_mz_offsets: None,
            additional_charges: None,
            peptide_candidate_masses: None,
            preliminary_matches: Vec::new(),
            title_charge: None,
            title: String::new(),
            run: String::new(),
            scan_number: None,
            elution_time_start: None,
            elution_time_end: None,
            source: String::new(),
            read_id: 0,
            tolerance: None,
        }
    }
}

impl Spectrum {
    pub fn add_peak(&mut self, mz: f64, intensity: f64) {
        self.peaks.push(SpectraPeak::new(mz, intensity));
    }

    /// Whether the consumer has to resolve the charge by trying each alternative
    pub fn is_charge_ambiguous(&self) -> bool {
        self.charge_alternatives.len() > 1
    }

    /// Assign a single, definite charge
    pub fn set_charge(&mut self, charge: i32) {
        self.precursor_charge = charge;
        self.charge_alternatives = vec![charge];
    }

    /// Mark the charge as unknown, emitting under `placeholder` while
    /// carrying `alternatives` for the consumer
    pub fn set_ambiguous_charge(&mut self, placeholder: i32, alternatives: Vec<i32>) {
        self.precursor_charge = placeholder;
        self.charge_alternatives = alternatives;
    }

    /// The neutral precursor mass under [`Spectrum::precursor_charge`]
    pub fn precursor_mass(&self) -> f64 {
        neutral_mass(self.precursor_mz, self.precursor_charge)
    }

    /// The largest neutral precursor mass any charge alternative implies
    pub fn max_precursor_mass(&self) -> f64 {
        let charge = self
            .charge_alternatives
            .iter()
            .copied()
            .max()
            .unwrap_or(self.precursor_charge);
        neutral_mass(self.precursor_mz, charge)
    }
}

impl fmt::Display for Spectrum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Spectrum({}:{} m/z={} z={:?}, {} peaks, from {})",
            self.run,
            self.scan_number
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.precursor_mz,
            self.charge_alternatives,
            self.peaks.len(),
            self.source
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::PROTON;

    #[test]
    fn test_charge_and_mass() {
        let mut spectrum = Spectrum {
            precursor_mz: 500.0,
            ..Default::default()
        };
        spectrum.set_charge(2);
        assert!(!spectrum.is_charge_ambiguous());
        assert!((spectrum.precursor_mass() - (1000.0 - 2.0 * PROTON)).abs() < 1e-9);
        assert_eq!(spectrum.max_precursor_mass(), spectrum.precursor_mass());

        spectrum.set_ambiguous_charge(4, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(spectrum.is_charge_ambiguous());
        assert_eq!(spectrum.precursor_charge, 4);
        assert!((spectrum.max_precursor_mass() - (3500.0 - 7.0 * PROTON)).abs() < 1e-9);
    }
}
