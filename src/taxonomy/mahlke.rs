//! Mahlke+ 2022: mixture of common factor analyzers over the VisNIR spectrum
//! and the geometric albedo.
//!
//! The feature vector is the 53-point log-reflectance on the Mahlke grid,
//! normalized against its nearest library spectrum, followed by `log10(pV)`.
//! Missing values (gaps, unknown albedo) are marginalized by the mixture.
//! Clusters map to classes through the rule table shipped with the model;
//! the class probability is the summed responsibility of its clusters.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use super::tree::{DecisionTable, Rule};
use super::{ensure_coverage, PreprocessOptions, Resolution, Scheme};
use crate::data::model::Spectrum;
use crate::error::{Error, Result};
use crate::mixture::MixtureModel;
use crate::preprocess::features::{self, Features};
use crate::preprocess::{mahlke_grid, resample, MAHLKE_MAX_GAP};

pub const CLASSES: [&str; 17] = [
    "A", "B", "C", "Ch", "D", "E", "K", "L", "M", "O", "P", "Q", "R", "S", "V", "X", "Z",
];

/// Number of spectral values in the feature vector.
pub const N_WAVE: usize = 53;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preprocessed {
    /// ln-reflectance on the Mahlke grid shifted onto the nearest library
    /// spectrum; NaN where missing.
    pub refl: Vec<f64>,
    /// log10(pV), NaN when unknown.
    pub pv_pre: f64,
    pub features: Features,
    /// Additive ln-offset applied during normalization.
    pub alpha: f64,
    /// Library spectrum used for the normalization.
    pub neighbour: String,
}

// ---------------------------------------------------------------------------
// Normalization library
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LibrarySpectrum {
    pub name: String,
    /// ln-reflectance on the Mahlke grid.
    pub refl: Vec<f64>,
}

/// Reference spectra the input is shifted onto before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct NormLibrary {
    entries: Vec<LibrarySpectrum>,
}

impl NormLibrary {
    pub fn new(entries: Vec<LibrarySpectrum>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Model("normalization library is empty".to_string()));
        }
        if let Some(bad) = entries.iter().find(|e| e.refl.len() != N_WAVE) {
            return Err(Error::Model(format!(
                "library spectrum '{}' has {} values, expected {N_WAVE}",
                bad.name,
                bad.refl.len()
            )));
        }
        Ok(NormLibrary { entries })
    }

    pub fn entries(&self) -> &[LibrarySpectrum] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shift `ln_refl` by the constant that best matches the closest library
    /// spectrum in the least-squares sense.
    ///
    /// Returns the shifted values, the offset and the neighbour's index.
    /// Only points finite in both curves take part in the fit.
    pub fn normalize(&self, ln_refl: &[f64]) -> Result<(Vec<f64>, f64, usize)> {
        let mut best: Option<(usize, f64, f64)> = None;

        for (index, entry) in self.entries.iter().enumerate() {
            let shared: Vec<(f64, f64)> = ln_refl
                .iter()
                .zip(&entry.refl)
                .filter(|(x, l)| x.is_finite() && l.is_finite())
                .map(|(x, l)| (*x, *l))
                .collect();
            if shared.is_empty() {
                continue;
            }

            let n = shared.len() as f64;
            let alpha = shared.iter().map(|(x, l)| l - x).sum::<f64>() / n;
            let residual = shared
                .iter()
                .map(|(x, l)| (x + alpha - l).powi(2))
                .sum::<f64>()
                / n;

            if best.map_or(true, |(_, _, r)| residual < r) {
                best = Some((index, alpha, residual));
            }
        }

        let (index, alpha, _) = best.ok_or_else(|| {
            Error::InvalidSpectrum(
                "no reflectance on the Mahlke grid overlaps the normalization library".to_string(),
            )
        })?;
        Ok((ln_refl.iter().map(|x| x + alpha).collect(), alpha, index))
    }
}

pub fn preprocess(
    spec: &Spectrum,
    library: &NormLibrary,
    options: &PreprocessOptions,
) -> Result<Preprocessed> {
    ensure_coverage(spec, Scheme::Mahlke)?;

    let features = features::detect(spec.wave(), spec.refl(), spec.flag());

    let grid = mahlke_grid();
    let resampled = resample(
        spec.wave(),
        spec.refl(),
        spec.flag(),
        &grid,
        Some(MAHLKE_MAX_GAP),
        options.tolerance(Scheme::Mahlke),
    );
    let ln_refl: Vec<f64> = resampled
        .iter()
        .map(|r| if *r > 0.0 { r.ln() } else { f64::NAN })
        .collect();

    let (refl, alpha, index) = library.normalize(&ln_refl)?;
    let neighbour = library.entries[index].name.clone();
    debug!(
        "[{}] mixnorm against '{neighbour}' with offset {alpha:.4}",
        spec.label()
    );

    Ok(Preprocessed {
        refl,
        pv_pre: spec.pv.map_or(f64::NAN, f64::log10),
        features,
        alpha,
        neighbour,
    })
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// How one mixture component is turned into a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterRule {
    /// The component maps to a single class.
    Class { class: String },
    /// Split on `pv_pre`; `classes` has one more entry than the ascending
    /// `thresholds`.
    Albedo {
        thresholds: Vec<f64>,
        classes: Vec<String>,
        unknown: String,
    },
    /// Split on one latent factor score.
    Latent {
        factor: usize,
        threshold: f64,
        below: String,
        above: String,
    },
}

impl ClusterRule {
    pub fn class_for(&self, pv_pre: f64, latent: &[f64]) -> &str {
        match self {
            ClusterRule::Class { class } => class.as_str(),
            ClusterRule::Albedo {
                thresholds,
                classes,
                unknown,
            } => {
                if pv_pre.is_nan() {
                    unknown.as_str()
                } else {
                    classes[thresholds.partition_point(|t| *t <= pv_pre)].as_str()
                }
            }
            ClusterRule::Latent {
                factor,
                threshold,
                below,
                above,
            } => {
                if latent[*factor] < *threshold {
                    below.as_str()
                } else {
                    above.as_str()
                }
            }
        }
    }

    fn classes(&self) -> Vec<&str> {
        match self {
            ClusterRule::Class { class } => vec![class.as_str()],
            ClusterRule::Albedo {
                classes, unknown, ..
            } => classes
                .iter()
                .map(String::as_str)
                .chain([unknown.as_str()])
                .collect(),
            ClusterRule::Latent { below, above, .. } => vec![below.as_str(), above.as_str()],
        }
    }

    fn validate(&self, n_factors: usize) -> Result<()> {
        if let Some(unknown) = self.classes().into_iter().find(|c| !CLASSES.contains(c)) {
            return Err(Error::Model(format!("unknown class '{unknown}' in cluster rule")));
        }
        match self {
            ClusterRule::Class { .. } => Ok(()),
            ClusterRule::Albedo {
                thresholds,
                classes,
                ..
            } => {
                if classes.len() != thresholds.len() + 1 {
                    return Err(Error::Model(format!(
                        "albedo rule with {} thresholds needs {} classes",
                        thresholds.len(),
                        thresholds.len() + 1
                    )));
                }
                if thresholds.windows(2).any(|w| !(w[0] < w[1])) {
                    return Err(Error::Model(
                        "albedo thresholds must be strictly ascending".to_string(),
                    ));
                }
                Ok(())
            }
            ClusterRule::Latent { factor, .. } if *factor >= n_factors => Err(Error::Model(
                format!("latent rule uses factor {factor} of a {n_factors}-factor model"),
            )),
            ClusterRule::Latent { .. } => Ok(()),
        }
    }
}

/// Fitted mixture plus one [`ClusterRule`] per component.
pub struct MahlkeModel {
    mixture: Box<dyn MixtureModel>,
    rules: Vec<ClusterRule>,
}

impl MahlkeModel {
    pub fn new(mixture: Box<dyn MixtureModel>, rules: Vec<ClusterRule>) -> Result<Self> {
        if mixture.n_features() != N_WAVE + 1 {
            return Err(Error::Model(format!(
                "mixture expects {} features, the Mahlke input has {}",
                mixture.n_features(),
                N_WAVE + 1
            )));
        }
        if rules.len() != mixture.n_components() {
            return Err(Error::Model(format!(
                "{} cluster rules for {} mixture components",
                rules.len(),
                mixture.n_components()
            )));
        }
        for rule in &rules {
            rule.validate(mixture.n_factors())?;
        }
        Ok(MahlkeModel { mixture, rules })
    }

    pub fn mixture(&self) -> &dyn MixtureModel {
        self.mixture.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MahlkeClassification {
    /// Most probable class after feature refinement, empty when not classified.
    pub class: String,
    /// Component with the highest responsibility.
    pub cluster: Option<usize>,
    /// Class the hard cluster maps to.
    pub cluster_class: String,
    pub responsibility: Vec<f64>,
    pub latent: Vec<f64>,
    /// Probability of every class in [`CLASSES`]; empty when not classified.
    pub class_probabilities: BTreeMap<String, f64>,
    pub features: Option<Features>,
    pub resolution: Resolution,
}

impl MahlkeClassification {
    pub fn insufficient_coverage(observed: (f64, f64), required: (f64, f64)) -> Self {
        MahlkeClassification {
            class: String::new(),
            cluster: None,
            cluster_class: String::new(),
            responsibility: Vec::new(),
            latent: Vec::new(),
            class_probabilities: BTreeMap::new(),
            features: None,
            resolution: Resolution::InsufficientCoverage { observed, required },
        }
    }

    pub fn probability(&self, class: &str) -> f64 {
        self.class_probabilities.get(class).copied().unwrap_or(0.0)
    }
}

struct Candidate {
    class: &'static str,
    features: Features,
}

fn refinement() -> DecisionTable<Candidate, Option<&'static str>> {
    DecisionTable::new(
        vec![
            Rule::new(
                "h-band",
                |c: &Candidate| c.features.h.is_present() && ["B", "C", "P"].contains(&c.class),
                Some("Ch"),
            ),
            Rule::new(
                "e-band",
                |c: &Candidate| c.features.e.is_present() && ["M", "P", "X"].contains(&c.class),
                Some("E"),
            ),
        ],
        None,
    )
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if !(v > b) => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

pub fn classify(spec: &Spectrum, model: &MahlkeModel) -> Result<MahlkeClassification> {
    let pre = spec
        .mahlke
        .as_ref()
        .ok_or_else(|| Error::PreprocessingOrder {
            scheme: Scheme::Mahlke,
            name: spec.label(),
        })?;

    let mut input = pre.refl.clone();
    input.push(pre.pv_pre);

    let mixture = model.mixture();
    let responsibility = mixture.responsibility(&input)?;
    let imputed = mixture.impute(&input)?;
    let latent = mixture.transform(&imputed)?;

    let cluster = argmax(&responsibility);
    let cluster_classes: Vec<&str> = model
        .rules
        .iter()
        .map(|rule| rule.class_for(pre.pv_pre, &latent))
        .collect();

    let mut class_probabilities: BTreeMap<String, f64> =
        CLASSES.iter().map(|c| (c.to_string(), 0.0)).collect();
    for (r, class) in responsibility.iter().zip(&cluster_classes) {
        *class_probabilities.entry(class.to_string()).or_default() += r;
    }

    let probabilities: Vec<f64> = CLASSES.iter().map(|c| class_probabilities[*c]).collect();
    let most_probable = argmax(&probabilities).map_or("", |i| CLASSES[i]);

    let candidate = Candidate {
        class: most_probable,
        features: pre.features,
    };
    let table = refinement();
    let decision = table.evaluate(&candidate);
    let class = (*decision.outcome).unwrap_or(most_probable);
    if decision.outcome.is_some() {
        debug!(
            "[{}] {} refines '{most_probable}' to '{class}'",
            spec.label(),
            decision.rule
        );
    }

    Ok(MahlkeClassification {
        class: class.to_string(),
        cluster,
        cluster_class: cluster
            .map(|k| cluster_classes[k].to_string())
            .unwrap_or_default(),
        responsibility,
        latent,
        class_probabilities,
        features: Some(pre.features),
        resolution: Resolution::Unique,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::features::BandStatus;
    use test_case::test_case;

    /// Mixture returning fixed outputs regardless of the input.
    struct FixedMixture {
        responsibility: Vec<f64>,
        latent: Vec<f64>,
    }

    impl MixtureModel for FixedMixture {
        fn n_components(&self) -> usize {
            self.responsibility.len()
        }
        fn n_factors(&self) -> usize {
            self.latent.len()
        }
        fn n_features(&self) -> usize {
            N_WAVE + 1
        }
        fn responsibility(&self, _: &[f64]) -> Result<Vec<f64>> {
            Ok(self.responsibility.clone())
        }
        fn impute(&self, features: &[f64]) -> Result<Vec<f64>> {
            Ok(features.iter().map(|v| if v.is_finite() { *v } else { 0.0 }).collect())
        }
        fn transform(&self, _: &[f64]) -> Result<Vec<f64>> {
            Ok(self.latent.clone())
        }
    }

    fn class(c: &str) -> ClusterRule {
        ClusterRule::Class {
            class: c.to_string(),
        }
    }

    fn model(responsibility: Vec<f64>, rules: Vec<ClusterRule>) -> MahlkeModel {
        MahlkeModel::new(
            Box::new(FixedMixture {
                responsibility,
                latent: vec![0.5, -1.0],
            }),
            rules,
        )
        .unwrap()
    }

    fn covering_spectrum(pv: Option<f64>) -> Spectrum {
        let wave: Vec<f64> = (0..=200).map(|i| 0.45 + 0.01 * i as f64).collect();
        let refl = wave.iter().map(|w| 1.0 + 0.1 * (w - 0.45)).collect();
        let spec = Spectrum::new(wave, refl).unwrap().named("test");
        match pv {
            Some(pv) => spec.with_albedo(pv),
            None => spec,
        }
    }

    fn flat_library() -> NormLibrary {
        NormLibrary::new(vec![
            LibrarySpectrum {
                name: "steep".to_string(),
                refl: (0..N_WAVE).map(|i| 0.05 * i as f64).collect(),
            },
            LibrarySpectrum {
                name: "flat".to_string(),
                refl: vec![0.2; N_WAVE],
            },
        ])
        .unwrap()
    }

    fn preprocess_flat(spec: &Spectrum) -> Result<Preprocessed> {
        preprocess(spec, &flat_library(), &PreprocessOptions::default())
    }

    fn preprocessed(features: Features, pv_pre: f64) -> Spectrum {
        let mut spec = covering_spectrum(None);
        spec.mahlke = Some(Preprocessed {
            refl: vec![0.0; N_WAVE],
            pv_pre,
            features,
            alpha: 0.0,
            neighbour: "flat".to_string(),
        });
        spec
    }

    fn no_features() -> Features {
        Features {
            e: BandStatus::Absent,
            h: BandStatus::Absent,
            k: BandStatus::Absent,
        }
    }

    #[test]
    fn library_shift_matches_nearest_shape() {
        let library = flat_library();
        let (shifted, alpha, index) = library.normalize(&vec![-0.1; N_WAVE]).unwrap();
        assert_eq!(index, 1);
        assert!((alpha - 0.3).abs() < 1e-12);
        assert!(shifted.iter().all(|v| (v - 0.2).abs() < 1e-12));
    }

    #[test]
    fn library_shift_keeps_missing_values() {
        let mut input = vec![0.0; N_WAVE];
        input[10] = f64::NAN;
        let (shifted, _, _) = flat_library().normalize(&input).unwrap();
        assert!(shifted[10].is_nan());
    }

    #[test]
    fn library_needs_overlap() {
        assert!(flat_library().normalize(&vec![f64::NAN; N_WAVE]).is_err());
        assert!(NormLibrary::new(Vec::new()).is_err());
    }

    #[test]
    fn preprocess_builds_53_point_vector() {
        let spec = covering_spectrum(Some(0.1));
        let pre = preprocess_flat(&spec).unwrap();
        assert_eq!(pre.refl.len(), N_WAVE);
        assert!(pre.refl.iter().all(|v| v.is_finite()));
        assert!((pre.pv_pre + 1.0).abs() < 1e-12);
        assert_eq!(pre.neighbour, "flat");
    }

    #[test]
    fn preprocess_without_albedo_leaves_it_missing() {
        let pre = preprocess_flat(&covering_spectrum(None)).unwrap();
        assert!(pre.pv_pre.is_nan());
    }

    #[test]
    fn flagged_edge_is_extended_only_within_tolerance() {
        let spec = covering_spectrum(None);
        let n = spec.len();
        let mut flags = vec![0u8; n];
        flags[n - 10..].iter_mut().for_each(|f| *f = 1);
        let spec = spec.with_flags(flags).unwrap();

        let pre = preprocess_flat(&spec).unwrap();
        assert!(pre.refl.iter().all(|v| v.is_finite()));

        let strict = PreprocessOptions {
            extrapolation_limit: 0.0,
            ..PreprocessOptions::default()
        };
        let pre = preprocess(&spec, &flat_library(), &strict).unwrap();
        assert!(pre.refl[N_WAVE - 1].is_nan());
        assert!(pre.refl[N_WAVE - 2].is_nan());
        assert!(pre.refl[N_WAVE - 3].is_finite());
    }

    #[test]
    fn preprocess_rejects_short_spectrum() {
        let spec = Spectrum::new(vec![0.5, 1.0], vec![1.0, 1.0]).unwrap();
        assert!(matches!(
            preprocess_flat(&spec),
            Err(Error::Coverage { .. })
        ));
    }

    #[test_case(f64::NAN, "X" ; "unknown albedo")]
    #[test_case(-1.5, "P" ; "dark")]
    #[test_case(-1.0, "M" ; "on threshold goes up")]
    #[test_case(-0.3, "E" ; "bright")]
    fn albedo_rule_splits_on_pv(pv_pre: f64, expected: &str) {
        let rule = ClusterRule::Albedo {
            thresholds: vec![-1.0, -0.5],
            classes: vec!["P".into(), "M".into(), "E".into()],
            unknown: "X".into(),
        };
        assert_eq!(rule.class_for(pv_pre, &[]), expected);
    }

    #[test]
    fn latent_rule_splits_on_factor() {
        let rule = ClusterRule::Latent {
            factor: 1,
            threshold: 0.0,
            below: "S".into(),
            above: "Q".into(),
        };
        assert_eq!(rule.class_for(f64::NAN, &[5.0, -0.2]), "S");
        assert_eq!(rule.class_for(f64::NAN, &[5.0, 0.2]), "Q");
    }

    #[test]
    fn model_validates_rules() {
        let mixture = || {
            Box::new(FixedMixture {
                responsibility: vec![0.5, 0.5],
                latent: vec![0.0],
            })
        };
        assert!(MahlkeModel::new(mixture(), vec![class("S")]).is_err());
        assert!(MahlkeModel::new(mixture(), vec![class("S"), class("Y")]).is_err());
        let latent = ClusterRule::Latent {
            factor: 3,
            threshold: 0.0,
            below: "S".into(),
            above: "Q".into(),
        };
        assert!(MahlkeModel::new(mixture(), vec![class("S"), latent]).is_err());
        assert!(MahlkeModel::new(mixture(), vec![class("S"), class("V")]).is_ok());
    }

    #[test]
    fn class_probabilities_sum_cluster_responsibilities() {
        let model = model(
            vec![0.3, 0.25, 0.45],
            vec![class("S"), class("S"), class("V")],
        );
        let spec = preprocessed(no_features(), f64::NAN);
        let result = classify(&spec, &model).unwrap();

        assert_eq!(result.class, "S");
        assert_eq!(result.cluster, Some(2));
        assert_eq!(result.cluster_class, "V");
        assert!((result.probability("S") - 0.55).abs() < 1e-12);
        assert!((result.probability("V") - 0.45).abs() < 1e-12);
        assert_eq!(result.class_probabilities.len(), CLASSES.len());
        assert_eq!(result.resolution, Resolution::Unique);
    }

    #[test]
    fn hydration_band_turns_c_into_ch() {
        let model = model(vec![1.0], vec![class("C")]);
        let features = Features {
            h: BandStatus::Present {
                centre: 0.7,
                depth: 0.03,
            },
            ..no_features()
        };
        let result = classify(&preprocessed(features, f64::NAN), &model).unwrap();
        assert_eq!(result.class, "Ch");
        assert_eq!(result.cluster_class, "C");
    }

    #[test]
    fn e_band_turns_x_into_e() {
        let model = model(vec![1.0], vec![class("X")]);
        let features = Features {
            e: BandStatus::Present {
                centre: 0.49,
                depth: 0.02,
            },
            ..no_features()
        };
        let result = classify(&preprocessed(features, f64::NAN), &model).unwrap();
        assert_eq!(result.class, "E");
    }

    #[test]
    fn e_band_leaves_s_alone() {
        let model = model(vec![1.0], vec![class("S")]);
        let features = Features {
            e: BandStatus::Present {
                centre: 0.49,
                depth: 0.02,
            },
            ..no_features()
        };
        let result = classify(&preprocessed(features, f64::NAN), &model).unwrap();
        assert_eq!(result.class, "S");
    }

    #[test]
    fn classify_requires_preprocessing() {
        let model = model(vec![1.0], vec![class("S")]);
        assert!(matches!(
            classify(&covering_spectrum(None), &model),
            Err(Error::PreprocessingOrder { .. })
        ));
    }
}
