use std::fmt;
use std::ops;
use std::slice;

use super::peak::SpectraPeak;
use crate::mass_error::Tolerance;

/// An m/z-ordered collection of [`SpectraPeak`], keyed by m/z: pushing a peak at
/// an m/z already present replaces the earlier peak.
#[derive(Default, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakSet {
    peaks: Vec<SpectraPeak>,
}

impl PeakSet {
    pub fn new(peaks: Vec<SpectraPeak>) -> Self {
        let mut inst = Self::empty();
        for peak in peaks {
            inst.push(peak);
        }
        inst
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peaks: Vec::with_capacity(capacity),
        }
    }

    pub fn empty() -> Self {
        Self::with_capacity(0)
    }

    pub fn push(&mut self, peak: SpectraPeak) {
        // Peak lists are almost always written in m/z order
        match self.peaks.last() {
            Some(last) if last.mz < peak.mz => self.peaks.push(peak),
            None => self.peaks.push(peak),
            Some(_) => match self._search_by(peak.mz) {
                Ok(i) => self.peaks[i] = peak,
                Err(i) => self.peaks.insert(i, peak),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, SpectraPeak> {
        self.peaks.iter()
    }

    pub fn as_slice(&self) -> &[SpectraPeak] {
        &self.peaks
    }

    fn _search_by(&self, query: f64) -> Result<usize, usize> {
        self.peaks.binary_search_by(|peak| peak.mz.total_cmp(&query))
    }

    /// All peaks whose m/z lies in `[low, high]`, widened by `tolerance`
    pub fn between(&self, low: f64, high: f64, tolerance: Tolerance) -> &[SpectraPeak] {
        let (lower_bound, _) = tolerance.bounds(low);
        let (_, upper_bound) = tolerance.bounds(high);
        let start = self
            .peaks
            .partition_point(|peak| peak.mz < lower_bound);
        let end = self
            .peaks
            .partition_point(|peak| peak.mz <= upper_bound);
        &self.peaks[start..end.max(start)]
    }

    /// The peak closest to `query` within `tolerance`, if any
    pub fn has_peak(&self, query: f64, tolerance: Tolerance) -> Option<&SpectraPeak> {
        self.between(query, query, tolerance).iter().min_by(|a, b| {
            (a.mz - query).abs().total_cmp(&(b.mz - query).abs())
        })
    }

    pub fn base_peak(&self) -> Option<&SpectraPeak> {
        self.peaks
            .iter()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
    }
}

impl ops::Index<usize> for PeakSet {
    type Output = SpectraPeak;

    fn index(&self, i: usize) -> &Self::Output {
        &self.peaks[i]
    }
}

impl fmt::Display for PeakSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeakSet(<{} Peaks>)", self.len())
    }
}

impl From<Vec<SpectraPeak>> for PeakSet {
    fn from(v: Vec<SpectraPeak>) -> PeakSet {
        PeakSet::new(v)
    }
}

impl FromIterator<SpectraPeak> for PeakSet {
    fn from_iter<T: IntoIterator<Item = SpectraPeak>>(iter: T) -> Self {
        let mut inst = Self::empty();
        for peak in iter {
            inst.push(peak);
        }
        inst
    }
}

impl<'a> IntoIterator for &'a PeakSet {
    type Item = &'a SpectraPeak;
    type IntoIter = slice::Iter<'a, SpectraPeak>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ordered_and_keyed() {
        let mut peaks = PeakSet::empty();
        peaks.push(SpectraPeak::new(200.0, 1.0));
        peaks.push(SpectraPeak::new(100.0, 2.0));
        peaks.push(SpectraPeak::new(300.0, 3.0));
        peaks.push(SpectraPeak::new(200.0, 5.0));

        assert_eq!(peaks.len(), 3);
        let mzs: Vec<f64> = peaks.iter().map(|p| p.mz).collect();
        assert_eq!(mzs, vec![100.0, 200.0, 300.0]);
        assert_eq!(peaks[1].intensity, 5.0);
        assert_eq!(peaks.base_peak().unwrap().mz, 200.0);
    }

    #[test]
    fn test_search() {
        let peaks: PeakSet = vec![(100.0, 1.0), (100.05, 2.0), (250.0, 3.0)]
            .into_iter()
            .map(SpectraPeak::from)
            .collect();
        let hit = peaks.has_peak(100.04, Tolerance::Da(0.02)).unwrap();
        assert_eq!(hit.mz, 100.05);
        assert!(peaks.has_peak(180.0, Tolerance::Da(0.02)).is_none());
        assert_eq!(peaks.between(99.0, 101.0, Tolerance::Da(0.0)).len(), 2);
    }
}
