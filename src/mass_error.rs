use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The fragment mass tolerance a spectrum's peaks are interpreted under.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tolerance {
    /// An absolute window in Daltons (or Thomson, for m/z values)
    Da(f64),
    /// A relative window in parts-per-million
    PPM(f64),
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::PPM(20.0)
    }
}

impl Tolerance {
    /// The half-width of the window around `reference`
    pub fn width(&self, reference: f64) -> f64 {
        match self {
            Self::Da(tol) => *tol,
            Self::PPM(tol) => reference * tol / 1e6,
        }
    }

    pub fn bounds(&self, reference: f64) -> (f64, f64) {
        let width = self.width(reference);
        (reference - width, reference + width)
    }

    /// Whether `query` falls within this tolerance of `reference`
    pub fn test(&self, reference: f64, query: f64) -> bool {
        (reference - query).abs() <= self.width(reference)
    }

    /// The signed error of `query` relative to `reference` in this tolerance's unit
    pub fn call(&self, reference: f64, query: f64) -> f64 {
        match self {
            Self::Da(_) => query - reference,
            Self::PPM(_) => (query - reference) / reference * 1e6,
        }
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Da(tol) => write!(f, "{tol} da"),
            Self::PPM(tol) => write!(f, "{tol} ppm"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToleranceParseError {
    #[error("Tolerance value could not be parsed from {0:?}")]
    InvalidValue(String),
    #[error("Unknown tolerance unit {0:?}, expected da, mz or ppm")]
    UnknownUnit(String),
}

impl FromStr for Tolerance {
    type Err = ToleranceParseError;

    /// Parses strings like `20ppm`, `20 ppm`, `0.02 da` or `0.02mz`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split_at = s
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (value, unit) = s.split_at(split_at);
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ToleranceParseError::InvalidValue(s.to_string()))?;
        match unit.trim().to_lowercase().as_str() {
            "ppm" => Ok(Self::PPM(value)),
            "da" | "mz" | "th" | "" => Ok(Self::Da(value)),
            other => Err(ToleranceParseError::UnknownUnit(other.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("20ppm".parse::<Tolerance>().unwrap(), Tolerance::PPM(20.0));
        assert_eq!("0.02 Da".parse::<Tolerance>().unwrap(), Tolerance::Da(0.02));
        assert_eq!(" 0.5mz ".parse::<Tolerance>().unwrap(), Tolerance::Da(0.5));
        assert!(matches!(
            "10 furlongs".parse::<Tolerance>(),
            Err(ToleranceParseError::UnknownUnit(_))
        ));
        assert!(matches!(
            "ppm".parse::<Tolerance>(),
            Err(ToleranceParseError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_window() {
        let tol = Tolerance::PPM(10.0);
        let (lo, hi) = tol.bounds(1000.0);
        assert!((lo - 999.99).abs() < 1e-9);
        assert!((hi - 1000.01).abs() < 1e-9);
        assert!(tol.test(1000.0, 1000.005));
        assert!(!tol.test(1000.0, 1000.02));
        assert!(Tolerance::Da(0.1).test(500.0, 500.05));
    }
}
