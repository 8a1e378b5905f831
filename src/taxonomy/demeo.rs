//! Classification following DeMeo+ 2009.
//!
//! The spectrum is normalized at 0.55 µm, slope-removed, resampled to the
//! 41-point 0.45–2.45 µm grid and projected onto the published principal
//! components. The class follows from the decision tree of DeMeo+ 2009,
//! Appendix B, expressed as ordered rule tables.

use log::{debug, warn};
use serde::Serialize;

use super::tree::{DecisionTable, Rule};
use super::{Classification, PreprocessOptions, Resolution, Scheme};
use crate::data::model::Spectrum;
use crate::error::{Error, Result};
use crate::preprocess::{self, DEMEO_LIMITS, SMOOTHING_WINDOW};

/// Normalization wavelength; its grid point is dropped before the projection.
pub const NORMALIZE_AT: f64 = 0.55;
pub const DROPPED_INDEX: usize = 2;

/// Slope at or above which S-complex and V/Q classes take the "w" suffix.
pub const WEATHERED_SLOPE: f64 = 0.25;

/// Data mean of the DeMeo+ 2009 reflectance spectra (0.55 µm removed).
#[rustfmt::skip]
pub const DATA_MEAN: [f64; 40] = [
    0.8840578, 0.94579985, 1.04016798, 1.07630094, 1.10387232, 1.10729138, 1.07101476, 1.02252107,
    0.99167561, 0.98766575, 1.00292349, 1.02223844, 1.04660108, 1.07201578, 1.08967345, 1.10014259,
    1.11101667, 1.12359452, 1.13128556, 1.13642896, 1.13467689, 1.12810013, 1.11471935, 1.09802574,
    1.07842635, 1.06127665, 1.04536074, 1.03360292, 1.02395605, 1.01587389, 1.01034821, 1.00915786,
    1.01078308, 1.01245031, 1.01298133, 1.01314109, 1.01236654, 1.01140562, 1.01090655, 1.00955344,
];

/// First five eigenvectors of DeMeo+ 2009.
#[rustfmt::skip]
pub const EIGENVECTORS: [[f64; 40]; 5] = [
    [
        -0.0766, -0.0391, 0.0438, 0.0876, 0.1256, 0.1466, 0.1271, 0.0888, 0.0680, 0.0857, 0.1371,
        0.1921, 0.2322, 0.2566, 0.2704, 0.2787, 0.2849, 0.2852, 0.2782, 0.2641, 0.2427, 0.2154,
        0.1841, 0.1531, 0.1247, 0.1002, 0.0804, 0.0665, 0.0570, 0.0513, 0.0502, 0.0538, 0.0607,
        0.0690, 0.0778, 0.0859, 0.0934, 0.0997, 0.1050, 0.1090,
    ],
    [
        -0.0643, -0.0279, 0.0176, 0.0343, 0.0471, 0.0096, -0.1186, -0.2673, -0.3645, -0.3743,
        -0.2899, -0.1527, -0.0381, 0.0306, 0.0708, 0.1053, 0.1385, 0.1598, 0.1645, 0.1520,
        0.1192, 0.0689, 0.0089, -0.0514, -0.1069, -0.1532, -0.1884, -0.2136, -0.2283, -0.2317,
        -0.2233, -0.2023, -0.1706, -0.1302, -0.0852, -0.0406, 0.0023, 0.0438, 0.0832, 0.1177,
    ],
    [
        -0.2724, -0.1270, 0.1128, 0.2104, 0.2726, 0.2475, 0.1486, 0.0420, -0.0385, -0.1168,
        -0.2083, -0.2809, -0.2747, -0.2169, -0.1713, -0.1427, -0.1031, -0.0407, 0.0243, 0.0930,
        0.1562, 0.2021, 0.2231, 0.2215, 0.2043, 0.1784, 0.1508, 0.1225, 0.0923, 0.0617, 0.0346,
        0.0136, -0.0038, -0.0229, -0.0447, -0.0678, -0.0911, -0.1153, -0.1389, -0.1580,
    ],
    [
        0.3046, 0.1525, -0.1486, -0.2677, -0.3386, -0.3284, -0.2392, -0.1453, -0.0921, -0.0505,
        -0.0289, -0.0277, -0.0160, 0.0077, 0.0304, 0.0450, 0.0608, 0.0842, 0.1104, 0.1387, 0.1609,
        0.1752, 0.1804, 0.1714, 0.1550, 0.1421, 0.1279, 0.1095, 0.0868, 0.0610, 0.0358, 0.0103,
        -0.0162, -0.0476, -0.0838, -0.1225, -0.1644, -0.2068, -0.2445, -0.2708,
    ],
    [
        -0.5174, -0.1876, 0.0593, 0.0754, 0.0523, -0.0231, -0.1466, -0.2569, -0.2293, -0.0657, 0.1077,
        0.1717, 0.1685, 0.1611, 0.1463, 0.1061, 0.0533, 0.0090, -0.0429, -0.0868, -0.1188, -0.1250,
        -0.1158, -0.0940, -0.0757, -0.0525, -0.0271, 0.0104, 0.0473, 0.0785, 0.1050, 0.1249, 0.1241,
        0.0916, 0.0354, -0.0327, -0.1126, -0.1993, -0.2884, -0.3767,
    ],
];

/// DeMeo grid representation of a spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preprocessed {
    /// Normalized, slope-removed reflectance on the 41-point grid.
    pub refl: Vec<f64>,
    pub refl_err: Vec<f64>,
    /// Fitted slope over 0.45–2.45 µm, reflectance per µm.
    pub slope: f64,
    pub smoothed: bool,
}

pub fn preprocess(spec: &Spectrum, options: &PreprocessOptions) -> Result<Preprocessed> {
    super::ensure_coverage(spec, Scheme::Demeo)?;
    let tolerance = options.tolerance(Scheme::Demeo);

    let refl = if options.smooth {
        preprocess::smooth(spec.refl(), spec.flag(), SMOOTHING_WINDOW)
    } else {
        spec.refl().to_vec()
    };

    let normalized = preprocess::normalize(spec.wave(), &refl, spec.flag(), NORMALIZE_AT)?;
    let (detrended, slope) = preprocess::remove_slope(
        spec.wave(),
        &normalized,
        spec.flag(),
        DEMEO_LIMITS,
        NORMALIZE_AT,
    )?;

    let grid = preprocess::demeo_grid();
    let resampled =
        preprocess::resample(spec.wave(), &detrended, spec.flag(), &grid, None, tolerance);

    // Flagged points at the edges can shrink the usable range below the grid
    if resampled.iter().any(|r| !r.is_finite()) {
        let usable: Vec<f64> = spec
            .wave()
            .iter()
            .zip(spec.flag())
            .zip(&detrended)
            .filter(|((_, f), r)| **f == 0 && r.is_finite())
            .map(|((w, _), _)| *w)
            .collect();
        return Err(Error::Coverage {
            scheme: Scheme::Demeo,
            name: spec.label(),
            observed: (
                usable.first().copied().unwrap_or(f64::NAN),
                usable.last().copied().unwrap_or(f64::NAN),
            ),
            required: DEMEO_LIMITS,
        });
    }

    let refl_err = preprocess::resample_errors(spec.wave(), spec.refl_err(), &grid, tolerance);
    debug!("[{}]: DeMeo slope {slope:.4} /µm", spec.label());

    Ok(Preprocessed {
        refl: resampled,
        refl_err,
        slope,
        smoothed: options.smooth,
    })
}

/// Drop the 0.55 µm point and subtract the data mean.
pub fn demean(refl: &[f64]) -> Vec<f64> {
    refl.iter()
        .enumerate()
        .filter(|(i, _)| *i != DROPPED_INDEX)
        .zip(DATA_MEAN.iter())
        .map(|((_, r), mean)| r - mean)
        .collect()
}

/// Project a demeaned 40-element vector onto PC1…PC5.
pub fn project(demeaned: &[f64]) -> [f64; 5] {
    let mut scores = [0.0; 5];
    for (score, eigenvector) in scores.iter_mut().zip(EIGENVECTORS.iter()) {
        *score = eigenvector.iter().zip(demeaned).map(|(e, x)| e * x).sum();
    }
    scores
}

// ---------------------------------------------------------------------------
// Decision tree
// ---------------------------------------------------------------------------

/// Position of a spectrum in the space the tree is defined on.
#[derive(Debug, Clone, Copy)]
pub struct Point {
    pub pc: [f64; 5],
    pub slope: f64,
    /// Preprocessed reflectance at the first grid point (0.45 µm).
    pub refl_045: f64,
}

impl Point {
    fn pc1(&self) -> f64 {
        self.pc[0]
    }
    fn pc2(&self) -> f64 {
        self.pc[1]
    }
    fn pc3(&self) -> f64 {
        self.pc[2]
    }
    fn pc4(&self) -> f64 {
        self.pc[3]
    }
    fn pc5(&self) -> f64 {
        self.pc[4]
    }
}

/// Boundary line `PC1 = a·PC2 + b` in the PC1/PC2 plane.
#[derive(Debug, Clone, Copy)]
pub struct Line {
    pub a: f64,
    pub b: f64,
}

impl Line {
    pub fn at(self, pc2: f64) -> f64 {
        self.a * pc2 + self.b
    }
}

pub const ALPHA: Line = Line { a: -3.0, b: -0.28 };
pub const BETA: Line = Line { a: -3.0, b: 0.35 };
pub const GAMMA: Line = Line { a: -3.0, b: 1.0 };
pub const DELTA: Line = Line { a: -3.0, b: 1.5 };
pub const EPSILON: Line = Line { a: 1.0 / 3.0, b: 0.55 };
pub const ZETA: Line = Line { a: 1.0 / 3.0, b: -0.10 };
pub const ETA: Line = Line { a: 1.0 / 3.0, b: -0.40 };
pub const THETA: Line = Line { a: -3.0, b: 0.7 };

fn above(p: &Point, line: Line) -> bool {
    p.pc1() > line.at(p.pc2())
}
fn on_or_above(p: &Point, line: Line) -> bool {
    p.pc1() >= line.at(p.pc2())
}
fn below(p: &Point, line: Line) -> bool {
    p.pc1() < line.at(p.pc2())
}
fn on_or_below(p: &Point, line: Line) -> bool {
    p.pc1() <= line.at(p.pc2())
}

fn rule(name: &'static str, test: fn(&Point) -> bool, outcome: Outcome) -> Rule<Point, Outcome> {
    Rule::new(name, test, outcome)
}

pub enum Outcome {
    Class(&'static str),
    /// Base class, with "w" appended when the slope reaches [`WEATHERED_SLOPE`].
    Weathered(&'static str),
    /// Best-guess class plus the classes it cannot be told apart from.
    Ambiguous(&'static str, &'static [&'static str]),
    Indeterminate(&'static str, &'static [&'static str]),
    Subtree(fn() -> DecisionTable<Point, Outcome>),
}

pub fn root() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule(
                "visir-1: featureless or basaltic",
                |p| p.pc1() < -0.3 && p.pc2() >= 0.2 && p.slope >= 0.4,
                Outcome::Subtree(tier_one),
            ),
            rule("visir-2: above alpha", |p| above(p, ALPHA), Outcome::Subtree(tier_two)),
        ],
        Outcome::Subtree(tier_three),
    )
}

fn tier_one() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule("A", |p| (0.55..1.5).contains(&p.slope), Outcome::Class("A")),
            rule("Sa", |p| (0.4..0.55).contains(&p.slope), Outcome::Class("Sa")),
        ],
        Outcome::Indeterminate("indeterminate after VisIR step 1", &["A", "Sa"]),
    )
}

fn tier_two() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule("V", |p| on_or_above(p, GAMMA), Outcome::Weathered("V")),
            rule(
                "O",
                |p| on_or_below(p, ETA) && on_or_above(p, THETA) && below(p, DELTA),
                Outcome::Class("O"),
            ),
            rule(
                "Q",
                |p| on_or_below(p, ETA) && on_or_above(p, ALPHA) && below(p, THETA),
                Outcome::Weathered("Q"),
            ),
            rule(
                "R",
                |p| on_or_above(p, ETA) && on_or_above(p, GAMMA) && below(p, DELTA),
                Outcome::Class("R"),
            ),
        ],
        Outcome::Subtree(s_complex),
    )
}

fn s_complex() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule(
                "S",
                |p| below(p, BETA) && above(p, DELTA),
                Outcome::Weathered("S"),
            ),
            rule(
                "Sq",
                |p| on_or_above(p, ALPHA) && below(p, BETA) && above(p, ETA) && on_or_below(p, ZETA),
                Outcome::Weathered("Sq"),
            ),
            rule(
                "Sr",
                |p| on_or_above(p, BETA) && below(p, GAMMA) && above(p, ETA) && on_or_below(p, EPSILON),
                Outcome::Weathered("Sr"),
            ),
            rule(
                "Sv",
                |p| on_or_above(p, BETA) && above(p, EPSILON) && below(p, GAMMA),
                Outcome::Weathered("Sv"),
            ),
        ],
        Outcome::Ambiguous("S", &["Sq", "Sr", "Sv"]),
    )
}

fn tier_three() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule(
                "D",
                |p| (0.38..1.5).contains(&p.slope) && p.pc1() > -0.44 && p.pc1() < 0.4,
                Outcome::Ambiguous("D", &["A"]),
            ),
            rule(
                "T",
                |p| {
                    p.slope > 0.25
                        && p.slope < 0.38
                        && p.pc2() > -0.28
                        && p.pc2() < -0.2
                        && p.pc3() > -0.2
                        && p.pc3() < -0.12
                },
                Outcome::Class("T"),
            ),
            rule(
                "L",
                |p| p.pc1() > 0.07 && p.pc1() < 1.0 && p.pc2() > -0.5 && p.pc2() < -0.15,
                Outcome::Ambiguous("L", &["Xe"]),
            ),
            rule(
                "K",
                |p| {
                    p.pc3() > -0.075
                        && p.pc3() < 0.14
                        && (-0.2..-0.1).contains(&p.pc2())
                        && p.pc1() > -0.8
                        && p.pc1() < -0.1
                },
                Outcome::Ambiguous("K", &["Xe"]),
            ),
        ],
        Outcome::Subtree(c_and_x_complexes),
    )
}

fn c_and_x_complexes() -> DecisionTable<Point, Outcome> {
    DecisionTable::new(
        vec![
            rule(
                "B",
                |p| p.slope > -0.2 && p.slope < 0.0 && p.pc1() > -1.2 && p.pc1() < 0.0 && p.pc4() < 0.0,
                Outcome::Class("B"),
            ),
            rule(
                "X",
                |p| p.slope > 0.2 && p.slope < 0.38,
                Outcome::Ambiguous("X", &["Xk", "Xe", "C"]),
            ),
            rule(
                "Cgh",
                |p| p.pc4() > 0.01 && p.pc4() < 0.14 && p.pc1() > -0.75 && p.pc1() < -0.27 && p.refl_045 < 0.92,
                Outcome::Ambiguous("Cgh", &["Xk"]),
            ),
            rule(
                "Ch",
                |p| p.pc4() > 0.01 && p.pc4() < 0.14 && p.pc1() > -0.75 && p.pc1() < -0.27,
                Outcome::Ambiguous("Ch", &["Xk"]),
            ),
            rule(
                "Cb",
                |p| p.pc4() > -0.04 && p.pc4() < 0.02 && p.pc5() > -0.07 && p.pc5() < -0.04,
                Outcome::Class("Cb"),
            ),
            rule(
                "C",
                |p| p.pc1() > -0.85 && p.pc1() < -0.45 && p.pc5() > -0.06 && p.pc5() < -0.02,
                Outcome::Ambiguous("C", &["Ch", "Xk"]),
            ),
            rule(
                "Cg",
                |p| (0.02..0.1).contains(&p.pc5()) && p.pc1() > -0.6 && p.pc1() < -0.16,
                Outcome::Ambiguous("Cg", &["Cgh", "Xk"]),
            ),
            rule(
                "Xk",
                |p| (-0.45..0.1).contains(&p.pc1()) && p.pc5() > -0.06 && p.pc5() < 0.05,
                Outcome::Ambiguous("Xk", &["Xc", "Xe", "X", "Ch"]),
            ),
            rule(
                "Xe",
                |p| (-0.1..0.3).contains(&p.pc1()) && p.pc2() > -0.5 && p.pc2() < -0.2,
                Outcome::Ambiguous("Xe", &["L"]),
            ),
        ],
        Outcome::Indeterminate(
            "indeterminate C/X-complex member after VisIR resolution",
            &["B", "C", "Cb", "Cg", "Cgh", "Ch", "X", "Xe", "Xk"],
        ),
    )
}

/// Walk the tree from the root to a leaf.
///
/// Returns the class (empty when indeterminate), the resolution and the names
/// of the rules taken.
pub fn decide(point: &Point) -> (String, Resolution, Vec<&'static str>) {
    let mut table = root();
    let mut path = Vec::new();

    loop {
        let decision = table.evaluate(point);
        path.push(decision.rule);

        let (class, resolution) = match decision.outcome {
            Outcome::Subtree(next) => {
                let next = *next;
                table = next();
                continue;
            }
            Outcome::Class(class) => (class.to_string(), Resolution::Unique),
            Outcome::Weathered(base) if point.slope >= WEATHERED_SLOPE => {
                (format!("{base}w"), Resolution::Unique)
            }
            Outcome::Weathered(base) => (base.to_string(), Resolution::Unique),
            Outcome::Ambiguous(class, others) => (
                class.to_string(),
                Resolution::Ambiguous {
                    alternatives: others.iter().map(|c| c.to_string()).collect(),
                },
            ),
            Outcome::Indeterminate(reason, candidates) => (
                String::new(),
                Resolution::Indeterminate {
                    candidates: candidates.iter().map(|c| c.to_string()).collect(),
                    reason: reason.to_string(),
                },
            ),
        };
        return (class, resolution, path);
    }
}

pub fn classify(spec: &Spectrum) -> Result<Classification> {
    let Some(pre) = spec.demeo.as_ref() else {
        return Err(Error::PreprocessingOrder {
            scheme: Scheme::Demeo,
            name: spec.label(),
        });
    };
    if pre.refl.len() != DATA_MEAN.len() + 1 {
        return Err(Error::InvalidSpectrum(format!(
            "DeMeo representation has {} points, expected {}",
            pre.refl.len(),
            DATA_MEAN.len() + 1
        )));
    }

    let scores = project(&demean(&pre.refl));
    let point = Point {
        pc: scores,
        slope: pre.slope,
        refl_045: pre.refl[0],
    };

    let (class, resolution, path) = decide(&point);
    debug!("[{}]: DeMeo decision path {}", spec.label(), path.join(" > "));

    match &resolution {
        Resolution::Ambiguous { alternatives } => warn!(
            "[{}]: DeMeo+ 09 class is either {class} or {}",
            spec.label(),
            alternatives.join(", ")
        ),
        Resolution::Indeterminate { reason, candidates } => warn!(
            "[{}]: DeMeo+ 09 class is {reason} ({})",
            spec.label(),
            candidates.join(", ")
        ),
        _ => {}
    }

    Ok(Classification {
        class,
        scores: scores.to_vec(),
        resolution,
    })
}
