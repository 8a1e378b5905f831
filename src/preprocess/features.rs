//! Detection of the diagnostic e / h / k absorption bands.
//!
//! A linear continuum is drawn between the reflectance at the band's lower
//! and upper edge and divided out; the band counts as present when the
//! deepest point of the continuum-removed curve sits inside the band's centre
//! window and is at least [`MIN_BAND_DEPTH`] below the continuum.

use serde::Serialize;

use super::interpolate;

/// Minimum relative depth (1 − refl/continuum) of a detected band.
pub const MIN_BAND_DEPTH: f64 = 0.01;

/// Minimum number of usable points inside a band to attempt a detection.
const MIN_BAND_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Band {
    /// 0.49 µm band.
    E,
    /// 0.7 µm band, indicative of hydrated minerals.
    H,
    /// 0.9 µm band.
    K,
}

impl Band {
    /// Band edges in µm.
    pub fn limits(self) -> (f64, f64) {
        match self {
            Band::E => (0.45, 0.539),
            Band::H => (0.549, 0.909),
            Band::K => (0.75, 1.05),
        }
    }

    /// Window the band minimum has to fall into.
    pub fn centre(self) -> (f64, f64) {
        match self {
            Band::E => (0.47, 0.51),
            Band::H => (0.63, 0.77),
            Band::K => (0.80, 0.95),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BandStatus {
    Present { centre: f64, depth: f64 },
    Absent,
    NotCovered,
}

impl BandStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, BandStatus::Present { .. })
    }
}

/// Outcome of the band search for one spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Features {
    pub e: BandStatus,
    pub h: BandStatus,
    pub k: BandStatus,
}

/// Search all three bands.
pub fn detect(wave: &[f64], refl: &[f64], flag: &[u8]) -> Features {
    let keep: Vec<usize> = (0..wave.len())
        .filter(|&i| refl[i].is_finite() && flag[i] == 0)
        .collect();
    let xp: Vec<f64> = keep.iter().map(|&i| wave[i]).collect();
    let fp: Vec<f64> = keep.iter().map(|&i| refl[i]).collect();

    Features {
        e: detect_band(Band::E, &xp, &fp),
        h: detect_band(Band::H, &xp, &fp),
        k: detect_band(Band::K, &xp, &fp),
    }
}

fn detect_band(band: Band, wave: &[f64], refl: &[f64]) -> BandStatus {
    let (lower, upper) = band.limits();

    let (Some(r_lower), Some(r_upper)) = (
        interpolate(lower, wave, refl, 0.0),
        interpolate(upper, wave, refl, 0.0),
    ) else {
        return BandStatus::NotCovered;
    };

    let inside: Vec<(f64, f64)> = wave
        .iter()
        .zip(refl)
        .filter(|(w, _)| **w > lower && **w < upper)
        .map(|(w, r)| (*w, *r))
        .collect();
    if inside.len() < MIN_BAND_POINTS {
        return BandStatus::NotCovered;
    }

    let gradient = (r_upper - r_lower) / (upper - lower);
    let deepest = inside
        .iter()
        .map(|(w, r)| {
            let continuum = r_lower + gradient * (w - lower);
            (*w, 1.0 - r / continuum)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let Some((centre, depth)) = deepest else {
        return BandStatus::NotCovered;
    };

    let (c_lo, c_hi) = band.centre();
    if depth >= MIN_BAND_DEPTH && centre >= c_lo && centre <= c_hi {
        BandStatus::Present { centre, depth }
    } else {
        BandStatus::Absent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_with_dip(centre: f64, depth: f64, width: f64) -> (Vec<f64>, Vec<f64>) {
        let wave: Vec<f64> = (0..=70).map(|i| 0.40 + 0.01 * i as f64).collect();
        let refl = wave
            .iter()
            .map(|w| 1.0 - depth * (-(w - centre).powi(2) / (2.0 * width * width)).exp())
            .collect();
        (wave, refl)
    }

    #[test]
    fn finds_hydration_band() {
        let (wave, refl) = flat_with_dip(0.70, 0.04, 0.04);
        let features = detect(&wave, &refl, &vec![0; wave.len()]);
        assert!(features.h.is_present());
        assert!(!features.e.is_present());
        match features.h {
            BandStatus::Present { centre, .. } => assert!((centre - 0.70).abs() < 0.011),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shallow_dip_is_absent() {
        let (wave, refl) = flat_with_dip(0.70, 0.002, 0.04);
        let features = detect(&wave, &refl, &vec![0; wave.len()]);
        assert_eq!(features.h, BandStatus::Absent);
    }

    #[test]
    fn bands_outside_range_are_not_covered() {
        let wave: Vec<f64> = (0..=20).map(|i| 0.60 + 0.01 * i as f64).collect();
        let refl = vec![1.0; wave.len()];
        let features = detect(&wave, &refl, &vec![0; wave.len()]);
        assert_eq!(features.e, BandStatus::NotCovered);
        assert_eq!(features.k, BandStatus::NotCovered);
        assert_eq!(features.h, BandStatus::NotCovered);
    }
}
