//! Classification following Tholen 1984.
//!
//! The eight ECAS reflectances are turned into seven colour indices,
//! standardized and projected onto the published eigenvectors. The class of
//! the nearest ECAS reference asteroid in the 7-D score space is refined with
//! the geometric albedo.

use log::{debug, warn};
use serde::Serialize;

use super::tree::{DecisionTable, Rule};
use super::{Classification, PreprocessOptions, Resolution, Scheme};
use crate::data::model::Spectrum;
use crate::error::Result;
use crate::preprocess::{self, ECAS_WAVE};
use crate::reference::EcasScores;

/// Wavelength range spanned by the ECAS filters.
pub const LIMITS: (f64, f64) = (0.337, 1.041);

/// Index of the v filter (0.55 µm), the normalization point.
const V_FILTER: usize = 3;

/// Mean and standard deviation of the ECAS colours, Tholen 1984 Table II.
pub const ECAS_MEAN: [f64; 7] = [0.325, 0.234, 0.089, 0.091, 0.105, 0.103, 0.111];
pub const ECAS_STD: [f64; 7] = [0.221, 0.173, 0.092, 0.081, 0.091, 0.104, 0.120];

/// Eigenvectors of the PCA, Tholen 1984 Table IV.
#[rustfmt::skip]
pub const EIGENVECTORS: [[f64; 7]; 7] = [
    [0.346, 0.373, 0.415, 0.433, 0.399, 0.336, 0.330],
    [-0.463, -0.416, -0.289, 0.000, 0.320, 0.475, 0.448],
    [0.231, 0.207, 0.028, -0.622, -0.290, -0.002, 0.657],
    [-0.207, -0.103, 0.028, 0.586, -0.399, -0.460, 0.481],
    [0.442, 0.044, -0.707, 0.094, 0.398, -0.347, 0.124],
    [-0.303, -0.039, 0.398, -0.271, 0.580, -0.574, 0.100],
    [0.531, -0.795, 0.292, -0.016, -0.010, -0.022, 0.031],
];

/// ECAS representation of a spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preprocessed {
    /// Reflectance at the eight ECAS wavelengths, unity at the v filter.
    pub refl: [f64; 8],
    /// s−v, u−v, b−v, v−w, v−x, v−p, v−z in magnitudes.
    pub colors: [f64; 7],
}

pub fn preprocess(spec: &Spectrum, options: &PreprocessOptions) -> Result<Preprocessed> {
    super::ensure_coverage(spec, Scheme::Tholen)?;

    let resampled = preprocess::resample(
        spec.wave(),
        spec.refl(),
        spec.flag(),
        &ECAS_WAVE,
        None,
        options.tolerance(Scheme::Tholen),
    );
    let normalized = preprocess::normalize(&ECAS_WAVE, &resampled, &[0; 8], ECAS_WAVE[V_FILTER])?;

    let mut refl = [0.0; 8];
    refl.copy_from_slice(&normalized);

    Ok(Preprocessed {
        refl,
        colors: colors(&refl),
    })
}

/// Colour indices relative to the v filter.
fn colors(refl: &[f64; 8]) -> [f64; 7] {
    let mag = |r: f64| -2.5 * r.log10();
    [
        mag(refl[0]),
        mag(refl[1]),
        mag(refl[2]),
        -mag(refl[4]),
        -mag(refl[5]),
        -mag(refl[6]),
        -mag(refl[7]),
    ]
}

/// Standardize the colours and project them onto the eigenvectors.
pub fn scores(colors: &[f64; 7]) -> [f64; 7] {
    let standardized: Vec<f64> = colors
        .iter()
        .zip(ECAS_MEAN.iter().zip(ECAS_STD.iter()))
        .map(|(c, (mean, std))| (c - mean) / std)
        .collect();
    project(&standardized)
}

/// Linear projection onto the eigenvector basis.
pub fn project(standardized: &[f64]) -> [f64; 7] {
    let mut out = [0.0; 7];
    for (score, eigenvector) in out.iter_mut().zip(EIGENVECTORS.iter()) {
        *score = eigenvector
            .iter()
            .zip(standardized)
            .map(|(e, x)| e * x)
            .sum();
    }
    out
}

/// Row of the reference table closest to `scores`; ties keep the earlier row.
pub fn nearest<'t>(scores: &[f64; 7], table: &'t [EcasScores]) -> Option<(&'t EcasScores, f64)> {
    let mut best: Option<(&EcasScores, f64)> = None;
    for row in table {
        let distance = row
            .scores
            .iter()
            .zip(scores)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        match best {
            Some((_, d)) if distance >= d => {}
            _ if distance.is_nan() => {}
            _ => best = Some((row, distance)),
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Albedo subtree
// ---------------------------------------------------------------------------

/// Input to the albedo subtree: coarse class and −2.5·log10(pV) (NaN if unknown).
#[derive(Debug, Clone)]
pub struct AlbedoPoint {
    pub coarse: String,
    pub magnitude: f64,
}

impl AlbedoPoint {
    pub fn new(coarse: &str, pv: Option<f64>) -> Self {
        AlbedoPoint {
            coarse: coarse.to_string(),
            magnitude: pv.map_or(f64::NAN, |pv| -2.5 * pv.log10()),
        }
    }

    fn is(&self, classes: &[&str]) -> bool {
        classes.contains(&self.coarse.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlbedoOutcome {
    Class(&'static str),
    Keep,
}

fn rule(
    name: &'static str,
    test: fn(&AlbedoPoint) -> bool,
    outcome: AlbedoOutcome,
) -> Rule<AlbedoPoint, AlbedoOutcome> {
    Rule::new(name, test, outcome)
}

const EMPX: [&str; 4] = ["E", "M", "P", "X"];
const CFBG: [&str; 4] = ["C", "F", "B", "G"];
const CB: [&str; 2] = ["C", "B"];

/// Rules comparing with NaN never fire, so an unknown albedo leaves the C/F/B/G
/// branch on "B" unless the E/M/P/X branch applies.
pub fn albedo_tree() -> DecisionTable<AlbedoPoint, AlbedoOutcome> {
    DecisionTable::new(
        vec![
            rule("emp-unknown-albedo", |p| p.is(&EMPX) && p.magnitude.is_nan(), AlbedoOutcome::Class("X")),
            rule("emp-dark", |p| p.is(&EMPX) && p.magnitude > 3.0, AlbedoOutcome::Class("P")),
            rule("emp-moderate", |p| p.is(&EMPX) && p.magnitude > 1.4, AlbedoOutcome::Class("M")),
            rule("emp-bright", |p| p.is(&EMPX), AlbedoOutcome::Class("E")),
            rule("cfbg-bright", |p| p.is(&CFBG) && p.magnitude <= 1.4, AlbedoOutcome::Class("E")),
            rule("cb-dark", |p| p.is(&CB) && p.magnitude > 3.0, AlbedoOutcome::Class("C")),
            rule("cb-other", |p| p.is(&CB), AlbedoOutcome::Class("B")),
        ],
        AlbedoOutcome::Keep,
    )
}

/// Class after the albedo subtree.
pub fn resolve_albedo(coarse: &str, pv: Option<f64>) -> String {
    let point = AlbedoPoint::new(coarse, pv);
    match albedo_tree().evaluate(&point).outcome {
        AlbedoOutcome::Class(class) => class.to_string(),
        AlbedoOutcome::Keep => point.coarse,
    }
}

pub fn classify(spec: &Spectrum, table: &[EcasScores]) -> Result<Classification> {
    let Some(pre) = spec.tholen.as_ref() else {
        return Err(crate::Error::PreprocessingOrder {
            scheme: Scheme::Tholen,
            name: spec.label(),
        });
    };

    let scores = scores(&pre.colors);
    if scores.iter().any(|s| !s.is_finite()) {
        warn!("[{}]: Tholen scores are not finite, class is indeterminate", spec.label());
        return Ok(Classification {
            class: String::new(),
            scores: scores.to_vec(),
            resolution: Resolution::Indeterminate {
                candidates: Vec::new(),
                reason: "non-finite ECAS colours".to_string(),
            },
        });
    }

    let Some((neighbour, distance)) = nearest(&scores, table) else {
        warn!("[{}]: Tholen reference table is empty", spec.label());
        return Ok(Classification {
            class: String::new(),
            scores: scores.to_vec(),
            resolution: Resolution::Indeterminate {
                candidates: Vec::new(),
                reason: "empty reference table".to_string(),
            },
        });
    };
    debug!(
        "[{}]: nearest ECAS asteroid is {} ({}) at distance {distance:.3}",
        spec.label(),
        neighbour.name,
        neighbour.class
    );

    // Historical two-letter classes keep their first letter
    let coarse: String = if neighbour.class.chars().count() == 2 {
        neighbour.class.chars().take(1).collect()
    } else {
        neighbour.class.clone()
    };

    let class = resolve_albedo(&coarse, spec.pv);
    let resolution = if class == "X" && spec.pv.is_none() {
        Resolution::Ambiguous {
            alternatives: vec!["E".into(), "M".into(), "P".into()],
        }
    } else {
        Resolution::Unique
    };

    Ok(Classification {
        class,
        scores: scores.to_vec(),
        resolution,
    })
}
