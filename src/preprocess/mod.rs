//! Preprocessing transforms shared by the taxonomic schemes.
//!
//! Every function here is pure: it takes sampled slices and returns freshly
//! allocated vectors, leaving the raw spectrum untouched.
//!
//! ```text
//!   raw wave/refl/flag
//!        │
//!        ├─ smooth         running mean (DeMeo, optional)
//!        ├─ normalize      refl(λ_ref) == 1
//!        ├─ remove_slope   subtract slope·(λ − λ_ref), report slope
//!        ├─ resample       linear interpolation onto a scheme grid
//!        └─ features       e / h / k absorption bands (Mahlke)
//! ```
pub mod features;

use crate::error::{Error, Result};

/// Central wavelengths of the eight ECAS filters (s, u, b, v, w, x, p, z).
pub const ECAS_WAVE: [f64; 8] = [0.337, 0.359, 0.437, 0.550, 0.701, 0.853, 0.948, 1.041];

pub const DEMEO_LIMITS: (f64, f64) = (0.45, 2.45);
pub const DEMEO_STEP: f64 = 0.05;

pub const MAHLKE_LIMITS: (f64, f64) = (0.45, 2.45);
pub const MAHLKE_STEP_VIS: f64 = 0.025;
pub const MAHLKE_STEP_NIR: f64 = 0.05;
pub const MAHLKE_VIS_NIR_TRANSITION: f64 = 1.05;

/// Grid points of the Mahlke grid lying in an observed gap wider than this
/// (in µm) are left missing instead of being interpolated.
pub const MAHLKE_MAX_GAP: f64 = 0.15;

/// Width in points of the running-mean filter.
pub const SMOOTHING_WINDOW: usize = 5;

/// Default extrapolation tolerance, in percent of a scheme's grid span.
pub const EXTRAPOLATION_LIMIT: f64 = 10.0;

/// Slack (µm) at the edges of the observed range absorbing rounding.
const EDGE_SLACK: f64 = 1e-9;

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Evenly spaced points from `start` to `stop` inclusive, rounded to 1 nm.
fn arange_inclusive(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let n = ((stop - start) / step).round() as usize;
    (0..=n).map(|i| round3(start + i as f64 * step)).collect()
}

/// DeMeo+ 2009 grid: 0.45 to 2.45 µm in 0.05 µm steps (41 points).
pub fn demeo_grid() -> Vec<f64> {
    arange_inclusive(DEMEO_LIMITS.0, DEMEO_LIMITS.1, DEMEO_STEP)
}

/// Mahlke+ 2022 grid: 0.025 µm steps up to 1.05 µm, 0.05 µm steps beyond.
pub fn mahlke_grid() -> Vec<f64> {
    let mut grid = arange_inclusive(MAHLKE_LIMITS.0, MAHLKE_VIS_NIR_TRANSITION, MAHLKE_STEP_VIS);
    grid.extend(arange_inclusive(
        MAHLKE_VIS_NIR_TRANSITION + MAHLKE_STEP_NIR,
        MAHLKE_LIMITS.1,
        MAHLKE_STEP_NIR,
    ));
    grid
}

/// Indices of the points usable for interpolation and fits.
fn usable(refl: &[f64], flag: &[u8]) -> Vec<usize> {
    refl.iter()
        .zip(flag)
        .enumerate()
        .filter(|(_, (r, f))| r.is_finite() && **f == 0)
        .map(|(i, _)| i)
        .collect()
}

/// Linear interpolation of `(xp, fp)` at `x`.
///
/// `xp` must be increasing. Up to `tolerance` µm outside `[xp[0], xp[n-1]]`
/// the edge value is returned; further out the result is `None`.
pub fn interpolate(x: f64, xp: &[f64], fp: &[f64], tolerance: f64) -> Option<f64> {
    let (first, last) = (*xp.first()?, *xp.last()?);
    let tolerance = tolerance.max(EDGE_SLACK);
    if x < first - tolerance || x > last + tolerance {
        return None;
    }
    if x <= first {
        return Some(fp[0]);
    }
    if x >= last {
        return Some(fp[fp.len() - 1]);
    }
    let upper = xp.partition_point(|&w| w < x);
    if xp[upper] == x {
        return Some(fp[upper]);
    }
    let lower = upper - 1;
    let t = (x - xp[lower]) / (xp[upper] - xp[lower]);
    Some(fp[lower] + t * (fp[upper] - fp[lower]))
}

/// Rescale `refl` so that its interpolated value at `at` equals 1.
pub fn normalize(wave: &[f64], refl: &[f64], flag: &[u8], at: f64) -> Result<Vec<f64>> {
    let keep = usable(refl, flag);
    let xp: Vec<f64> = keep.iter().map(|&i| wave[i]).collect();
    let fp: Vec<f64> = keep.iter().map(|&i| refl[i]).collect();

    match interpolate(at, &xp, &fp, 0.0) {
        Some(norm) if norm.is_finite() && norm != 0.0 => {
            Ok(refl.iter().map(|r| r / norm).collect())
        }
        _ => Err(Error::InvalidSpectrum(format!(
            "cannot normalize at {at} µm: no usable reflectance there"
        ))),
    }
}

/// Fit a line to the reflectance inside `interval` and subtract it.
///
/// The removed trend is anchored at `anchor` (`slope · (λ − anchor)`), so the
/// reflectance at the anchor wavelength is unchanged. Returns the de-trended
/// curve over the full input and the fitted slope in reflectance per µm.
pub fn remove_slope(
    wave: &[f64],
    refl: &[f64],
    flag: &[u8],
    interval: (f64, f64),
    anchor: f64,
) -> Result<(Vec<f64>, f64)> {
    let points: Vec<(f64, f64)> = usable(refl, flag)
        .into_iter()
        .map(|i| (wave[i], refl[i]))
        .filter(|(w, _)| *w >= interval.0 - EDGE_SLACK && *w <= interval.1 + EDGE_SLACK)
        .collect();

    if points.len() < 2 {
        return Err(Error::InvalidSpectrum(format!(
            "need at least two usable points in {:.3}-{:.3} µm to fit a slope",
            interval.0, interval.1
        )));
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let slope = sxy / sxx;

    let detrended = wave
        .iter()
        .zip(refl)
        .map(|(w, r)| r - slope * (w - anchor))
        .collect();

    Ok((detrended, slope))
}

/// Interpolate `values` onto `grid`, skipping flagged and non-finite points.
///
/// Grid points more than `tolerance` µm outside the usable range come back
/// as NaN. With `max_gap`, grid points whose bracketing observations are
/// further apart than `max_gap` µm are NaN as well.
pub fn resample(
    wave: &[f64],
    values: &[f64],
    flag: &[u8],
    grid: &[f64],
    max_gap: Option<f64>,
    tolerance: f64,
) -> Vec<f64> {
    let keep = usable(values, flag);
    let xp: Vec<f64> = keep.iter().map(|&i| wave[i]).collect();
    let fp: Vec<f64> = keep.iter().map(|&i| values[i]).collect();

    grid.iter()
        .map(|&x| {
            if let Some(gap) = max_gap {
                let upper = xp.partition_point(|&w| w < x);
                if upper > 0 && upper < xp.len() && xp[upper] != x {
                    if xp[upper] - xp[upper - 1] > gap {
                        return f64::NAN;
                    }
                }
            }
            interpolate(x, &xp, &fp, tolerance).unwrap_or(f64::NAN)
        })
        .collect()
}

/// Interpolate uncertainties onto `grid`; unknown (NaN) errors stay NaN.
pub fn resample_errors(wave: &[f64], refl_err: &[f64], grid: &[f64], tolerance: f64) -> Vec<f64> {
    if refl_err.iter().all(|e| e.is_nan()) {
        return vec![f64::NAN; grid.len()];
    }
    let flag = vec![0u8; wave.len()];
    resample(wave, refl_err, &flag, grid, None, tolerance)
}

/// Centred running mean over `window` points, truncated at the edges.
///
/// Flagged and non-finite samples are left out of every window average;
/// a flagged sample keeps its raw value.
pub fn smooth(values: &[f64], flag: &[u8], window: usize) -> Vec<f64> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            if flag[i] != 0 {
                return values[i];
            }
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            let good: Vec<f64> = (lo..hi)
                .filter(|&j| flag[j] == 0 && values[j].is_finite())
                .map(|j| values[j])
                .collect();
            if good.is_empty() {
                values[i]
            } else {
                good.iter().sum::<f64>() / good.len() as f64
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn demeo_grid_spans_045_to_245() {
        let grid = demeo_grid();
        assert_eq!(grid.len(), 41);
        assert_eq!(grid[0], 0.45);
        assert_eq!(grid[2], 0.55);
        assert_eq!(grid[40], 2.45);
    }

    #[test]
    fn mahlke_grid_switches_resolution_after_105() {
        let grid = mahlke_grid();
        assert_eq!(grid.len(), 53);
        assert_eq!(grid[0], 0.45);
        assert_eq!(grid[1], 0.475);
        assert_eq!(grid[24], 1.05);
        assert_eq!(grid[25], 1.1);
        assert_eq!(grid[52], 2.45);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn interpolates_linearly_and_refuses_to_extrapolate() {
        let xp = [0.4, 0.6, 0.8];
        let fp = [1.0, 2.0, 4.0];
        assert!(close(interpolate(0.5, &xp, &fp, 0.0).unwrap(), 1.5));
        assert!(close(interpolate(0.6, &xp, &fp, 0.0).unwrap(), 2.0));
        assert!(close(interpolate(0.7, &xp, &fp, 0.0).unwrap(), 3.0));
        assert_eq!(interpolate(0.39, &xp, &fp, 0.0), None);
        assert_eq!(interpolate(0.81, &xp, &fp, 0.0), None);
    }

    #[test]
    fn extrapolation_holds_edge_value_within_tolerance() {
        let xp = [0.4, 0.6, 0.8];
        let fp = [1.0, 2.0, 4.0];
        assert_eq!(interpolate(0.35, &xp, &fp, 0.1), Some(1.0));
        assert_eq!(interpolate(0.85, &xp, &fp, 0.1), Some(4.0));
        assert_eq!(interpolate(0.95, &xp, &fp, 0.1), None);
    }

    #[test]
    fn normalize_hits_unity_between_samples() {
        let wave = [0.5, 0.6];
        let refl = [0.2, 0.4];
        let norm = normalize(&wave, &refl, &[0, 0], 0.55).unwrap();
        assert!(close(norm[0], 2.0 / 3.0));
        assert!(close(norm[1], 4.0 / 3.0));
    }

    #[test]
    fn normalize_skips_flagged_points() {
        let wave = [0.5, 0.55, 0.6];
        let refl = [1.0, 99.0, 1.0];
        let norm = normalize(&wave, &refl, &[0, 1, 0], 0.55).unwrap();
        assert!(close(norm[0], 1.0));
    }

    #[test]
    fn remove_slope_recovers_gradient_and_keeps_anchor() {
        let wave: Vec<f64> = (0..10).map(|i| 0.5 + 0.1 * i as f64).collect();
        let refl: Vec<f64> = wave.iter().map(|w| 1.0 + 0.3 * (w - 0.5)).collect();
        let flag = vec![0; wave.len()];
        let (flat, slope) = remove_slope(&wave, &refl, &flag, (0.5, 1.4), 0.5).unwrap();
        assert!(close(slope, 0.3));
        assert!(flat.iter().all(|r| close(*r, 1.0)));
    }

    #[test]
    fn remove_slope_needs_two_points() {
        let err = remove_slope(&[0.5, 3.0], &[1.0, 1.0], &[0, 0], (0.45, 2.45), 0.55);
        assert!(err.is_err());
    }

    #[test]
    fn resample_marks_gaps_and_edges_missing() {
        let wave = [0.45, 0.5, 0.9, 1.0];
        let refl = [1.0, 1.0, 2.0, 2.0];
        let out = resample(&wave, &refl, &[0; 4], &[0.4, 0.475, 0.7, 1.0], Some(0.15), 0.0);
        assert!(out[0].is_nan());
        assert!(close(out[1], 1.0));
        assert!(out[2].is_nan());
        assert!(close(out[3], 2.0));

        let filled = resample(&wave, &refl, &[0; 4], &[0.7], None, 0.0);
        assert!(close(filled[0], 1.5));
    }

    #[test]
    fn resample_extends_flagged_edge_only_within_tolerance() {
        let wave = [0.4, 0.5, 0.6, 0.7];
        let refl = [1.0, 1.0, 2.0, 9.0];
        let flag = [0, 0, 0, 1];
        let near = resample(&wave, &refl, &flag, &[0.65], None, 0.1);
        assert!(close(near[0], 2.0));
        let far = resample(&wave, &refl, &flag, &[0.7], None, 0.05);
        assert!(far[0].is_nan());
    }

    #[test]
    fn smoothing_averages_centred_window() {
        let out = smooth(&[0.0, 3.0, 0.0, 3.0, 0.0], &[0; 5], 3);
        assert!(close(out[0], 1.5));
        assert!(close(out[1], 1.0));
        assert!(close(out[2], 2.0));
        assert!(close(out[4], 1.5));
    }

    #[test]
    fn smoothing_ignores_flagged_samples() {
        let out = smooth(&[1.0, 1.0, 50.0, 1.0, 1.0], &[0, 0, 1, 0, 0], 3);
        assert!(close(out[1], 1.0));
        assert!(close(out[3], 1.0));
        assert_eq!(out[2], 50.0);
    }
}
