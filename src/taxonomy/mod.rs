//! Taxonomic classification following Tholen 1984, DeMeo+ 2009 and Mahlke+ 2022.
//!
//! ```text
//!   Spectrum ──► Classifier::preprocess(scheme) ──► spectrum.{tholen,demeo,mahlke}
//!                                                         │
//!   ReferenceData (ECAS table, MCFA model, library) ──┐   │
//!                                                     ▼   ▼
//!                               Classifier::classify(scheme) ──► spectrum.class_<scheme>
//! ```
//!
//! Schemes are independent: each writes only its own fields on the spectrum.

pub mod demeo;
pub mod mahlke;
pub mod tholen;
pub mod tree;

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::data::model::Spectrum;
use crate::error::{Error, Result};
use crate::reference::{FileSource, ReferenceData, ReferenceSource};

// ---------------------------------------------------------------------------
// Scheme
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Tholen,
    Demeo,
    Mahlke,
}

impl Scheme {
    pub const ALL: [Scheme; 3] = [Scheme::Tholen, Scheme::Demeo, Scheme::Mahlke];

    /// Wavelength range (µm) the raw spectrum has to span.
    pub fn required_range(self) -> (f64, f64) {
        match self {
            Scheme::Tholen => tholen::LIMITS,
            Scheme::Demeo => crate::preprocess::DEMEO_LIMITS,
            Scheme::Mahlke => crate::preprocess::MAHLKE_LIMITS,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Scheme::Tholen => "tholen",
            Scheme::Demeo => "demeo",
            Scheme::Mahlke => "mahlke",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tholen => write!(f, "Tholen 1984"),
            Scheme::Demeo => write!(f, "DeMeo+ 2009"),
            Scheme::Mahlke => write!(f, "Mahlke+ 2022"),
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tholen" => Ok(Scheme::Tholen),
            "demeo" => Ok(Scheme::Demeo),
            "mahlke" => Ok(Scheme::Mahlke),
            other => Err(format!(
                "unknown scheme '{other}', choose one of tholen, demeo, mahlke"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a class label came about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// The tree resolved a single class.
    Unique,
    /// A best-guess class was assigned; the listed classes could not be excluded.
    Ambiguous { alternatives: Vec<String> },
    /// No class could be assigned; `candidates` lists what the branch could not separate.
    Indeterminate { candidates: Vec<String>, reason: String },
    /// The spectrum does not span the scheme's wavelength range.
    InsufficientCoverage {
        observed: (f64, f64),
        required: (f64, f64),
    },
}

/// Result of a Tholen or DeMeo classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    /// Class label, empty when indeterminate.
    pub class: String,
    /// Principal component scores, PC1 first.
    pub scores: Vec<f64>,
    pub resolution: Resolution,
}

impl Classification {
    pub fn insufficient_coverage(observed: (f64, f64), required: (f64, f64)) -> Self {
        Classification {
            class: String::new(),
            scores: Vec::new(),
            resolution: Resolution::InsufficientCoverage { observed, required },
        }
    }
}

/// Options recognised by [`Classifier::preprocess`].
#[derive(Debug, Clone, Copy)]
pub struct PreprocessOptions {
    /// Apply a running-mean filter before slope removal (DeMeo only).
    pub smooth: bool,
    /// How far resampling may extend the usable range, in percent of the
    /// scheme's grid span.
    pub extrapolation_limit: f64,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessOptions {
            smooth: false,
            extrapolation_limit: crate::preprocess::EXTRAPOLATION_LIMIT,
        }
    }
}

impl PreprocessOptions {
    /// Extrapolation tolerance for `scheme` in µm.
    pub fn tolerance(&self, scheme: Scheme) -> f64 {
        let (lo, hi) = scheme.required_range();
        self.extrapolation_limit.max(0.0) / 100.0 * (hi - lo)
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Entry point tying preprocessing, reference data and the three classifiers.
///
/// The reference data is injected and loaded lazily on first use; a
/// classifier can be shared across threads.
pub struct Classifier<S: ReferenceSource = FileSource> {
    reference: ReferenceData<S>,
}

pub(crate) fn ensure_coverage(spec: &Spectrum, scheme: Scheme) -> Result<()> {
    let required = scheme.required_range();
    if spec.covers(required.0, required.1) {
        Ok(())
    } else {
        Err(Error::Coverage {
            scheme,
            name: spec.label(),
            observed: spec.wave_range(),
            required,
        })
    }
}

impl<S: ReferenceSource> Classifier<S> {
    pub fn new(reference: ReferenceData<S>) -> Self {
        Classifier { reference }
    }

    pub fn reference(&self) -> &ReferenceData<S> {
        &self.reference
    }

    /// Derive the representation `scheme` was calibrated on.
    ///
    /// Replaces any earlier preprocessing and classification for `scheme`.
    pub fn preprocess<'s>(
        &self,
        spec: &'s mut Spectrum,
        scheme: Scheme,
        options: &PreprocessOptions,
    ) -> Result<&'s mut Spectrum> {
        debug!("[{}] preprocessing following {scheme}", spec.label());
        ensure_coverage(spec, scheme)?;

        match scheme {
            Scheme::Tholen => {
                let pre = tholen::preprocess(spec, options)?;
                spec.tholen = Some(pre);
                spec.class_tholen = None;
            }
            Scheme::Demeo => {
                let pre = demeo::preprocess(spec, options)?;
                spec.demeo = Some(pre);
                spec.class_demeo = None;
            }
            Scheme::Mahlke => {
                let library = self.reference.mahlke_library()?;
                let pre = mahlke::preprocess(spec, library, options)?;
                spec.mahlke = Some(pre);
                spec.class_mahlke = None;
            }
        }
        Ok(spec)
    }

    /// Classify a preprocessed spectrum under `scheme`.
    ///
    /// A spectrum not spanning the scheme's range receives an empty class with
    /// [`Resolution::InsufficientCoverage`] and no tree is evaluated.
    pub fn classify<'s>(&self, spec: &'s mut Spectrum, scheme: Scheme) -> Result<&'s mut Spectrum> {
        if let Err(Error::Coverage {
            observed, required, ..
        }) = ensure_coverage(spec, scheme)
        {
            record_insufficient_coverage(spec, scheme, observed, required);
            return Ok(spec);
        }

        if !spec.is_preprocessed(scheme) {
            warn!(
                "[{}]: classifying following {scheme} but not preprocessed yet",
                spec.label()
            );
            return Err(Error::PreprocessingOrder {
                scheme,
                name: spec.label(),
            });
        }

        match scheme {
            Scheme::Tholen => {
                let result = tholen::classify(spec, self.reference.tholen_table()?)?;
                spec.class_tholen = Some(result);
            }
            Scheme::Demeo => {
                let result = demeo::classify(spec)?;
                spec.class_demeo = Some(result);
            }
            Scheme::Mahlke => {
                let result = mahlke::classify(spec, self.reference.mahlke_model()?)?;
                spec.class_mahlke = Some(result);
            }
        }
        debug!(
            "[{}] {scheme} class: '{}'",
            spec.label(),
            spec.class(scheme).unwrap_or_default()
        );
        Ok(spec)
    }

    /// Preprocess and classify in one go.
    ///
    /// Coverage failures during preprocessing become the insufficient-coverage
    /// outcome instead of an error. On any other error the scheme's fields are
    /// restored to what they held before the call.
    pub fn run<'s>(
        &self,
        spec: &'s mut Spectrum,
        scheme: Scheme,
        options: &PreprocessOptions,
    ) -> Result<&'s mut Spectrum> {
        let saved = spec.take_scheme(scheme);
        let outcome = match self.preprocess(spec, scheme, options) {
            Ok(_) => self.classify(spec, scheme).map(|_| ()),
            Err(Error::Coverage {
                observed, required, ..
            }) => {
                record_insufficient_coverage(spec, scheme, observed, required);
                Ok(())
            }
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => Ok(spec),
            Err(err) => {
                spec.restore_scheme(saved);
                Err(err)
            }
        }
    }

    /// Run every scheme on every spectrum in parallel.
    ///
    /// The returned vector is aligned with `spectra`. Each entry lists the
    /// outcome of every scheme in `schemes` order; a failing scheme does not
    /// stop the others.
    pub fn classify_all(
        &self,
        spectra: &mut [Spectrum],
        schemes: &[Scheme],
        options: &PreprocessOptions,
    ) -> Vec<Vec<(Scheme, Result<()>)>> {
        spectra
            .par_iter_mut()
            .map(|spec| {
                schemes
                    .iter()
                    .map(|&scheme| (scheme, self.run(spec, scheme, options).map(|_| ())))
                    .collect()
            })
            .collect()
    }
}

fn record_insufficient_coverage(
    spec: &mut Spectrum,
    scheme: Scheme,
    observed: (f64, f64),
    required: (f64, f64),
) {
    info!(
        "[{}]: cannot classify following {scheme} - insufficient wavelength coverage ({:.3} - {:.3} µm)",
        spec.label(),
        observed.0,
        observed.1
    );
    match scheme {
        Scheme::Tholen => {
            spec.class_tholen = Some(Classification::insufficient_coverage(observed, required))
        }
        Scheme::Demeo => {
            spec.class_demeo = Some(Classification::insufficient_coverage(observed, required))
        }
        Scheme::Mahlke => {
            spec.class_mahlke = Some(mahlke::MahlkeClassification::insufficient_coverage(
                observed, required,
            ))
        }
    }
}
