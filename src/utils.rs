pub const PROTON: f64 = 1.00727646677;

/// The mass difference between the C13 and C12 isotopes, used to step
/// back over missed monoisotopic peaks.
pub const C13_MASS_DIFFERENCE: f64 = 1.00335483;

#[inline]
pub fn mass_charge_ratio(mass: f64, z: i32) -> f64 {
    (mass / (z.abs() as f64)) + z as f64 * PROTON
}

#[inline]
pub fn neutral_mass(mz: f64, z: i32) -> f64 {
    (mz * z.abs() as f64) - z as f64 * PROTON
}

/// Precursor m/z offsets for `count` missed monoisotopic peaks, nearest first.
pub fn missing_isotope_offsets(count: u32) -> Vec<f64> {
    (1..=count)
        .map(|i| -(i as f64) * C13_MASS_DIFFERENCE)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mass_round_trip() {
        let mz = mass_charge_ratio(1000.0, 2);
        assert!((neutral_mass(mz, 2) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_isotope_offsets() {
        let offsets = missing_isotope_offsets(2);
        assert_eq!(offsets.len(), 2);
        assert!((offsets[1] + 2.0 * C13_MASS_DIFFERENCE).abs() < 1e-12);
        assert!(missing_isotope_offsets(0).is_empty());
    }
}
