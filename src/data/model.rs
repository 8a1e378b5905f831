use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::taxonomy::{demeo, mahlke, tholen, Classification, Scheme};

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a metadata column
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value carried over from the input file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v:.4}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Try to interpret the value as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Spectrum – one measured reflectance curve plus per-scheme state
// ---------------------------------------------------------------------------

/// A single reflectance spectrum of an asteroid.
///
/// The sampled arrays are private so the equal-length and strictly-increasing
/// wavelength invariants hold for the lifetime of the value. Scheme-specific
/// state is added by [`crate::Classifier::preprocess`] and
/// [`crate::Classifier::classify`]; the raw arrays are never modified.
#[derive(Debug, Clone, Serialize)]
pub struct Spectrum {
    /// Wavelengths in µm, strictly increasing.
    wave: Vec<f64>,
    /// Reflectance, aligned with `wave`.
    refl: Vec<f64>,
    /// Reflectance uncertainty, NaN where unknown.
    refl_err: Vec<f64>,
    /// Quality flag per point: 0 is good, anything else is degraded/rejected.
    flag: Vec<u8>,

    pub name: String,
    pub source: String,
    /// Asteroid number, when the target is numbered.
    pub number: Option<u32>,
    /// Geometric albedo.
    pub pv: Option<f64>,
    /// Extra columns from the input file.
    pub metadata: BTreeMap<String, MetadataValue>,

    pub tholen: Option<tholen::Preprocessed>,
    pub demeo: Option<demeo::Preprocessed>,
    pub mahlke: Option<mahlke::Preprocessed>,

    pub class_tholen: Option<Classification>,
    pub class_demeo: Option<Classification>,
    pub class_mahlke: Option<mahlke::MahlkeClassification>,
}

impl Spectrum {
    /// Build a spectrum from wavelengths and reflectances.
    ///
    /// Uncertainties start out unknown (NaN) and all flags good.
    pub fn new(wave: Vec<f64>, refl: Vec<f64>) -> Result<Self> {
        if wave.len() != refl.len() {
            return Err(Error::InvalidSpectrum(format!(
                "wave has {} values but refl has {}",
                wave.len(),
                refl.len()
            )));
        }
        if let Some(bad) = wave.iter().find(|w| !w.is_finite()) {
            return Err(Error::InvalidSpectrum(format!(
                "non-finite wavelength {bad}"
            )));
        }
        if let Some(pair) = wave.windows(2).find(|pair| pair[1] <= pair[0]) {
            return Err(Error::InvalidSpectrum(format!(
                "wavelengths must be strictly increasing ({} followed by {})",
                pair[0], pair[1]
            )));
        }

        let n = wave.len();
        Ok(Spectrum {
            wave,
            refl,
            refl_err: vec![f64::NAN; n],
            flag: vec![0; n],
            name: String::new(),
            source: String::new(),
            number: None,
            pv: None,
            metadata: BTreeMap::new(),
            tholen: None,
            demeo: None,
            mahlke: None,
            class_tholen: None,
            class_demeo: None,
            class_mahlke: None,
        })
    }

    pub fn with_errors(mut self, refl_err: Vec<f64>) -> Result<Self> {
        if refl_err.len() != self.wave.len() {
            return Err(Error::InvalidSpectrum(format!(
                "refl_err has {} values but wave has {}",
                refl_err.len(),
                self.wave.len()
            )));
        }
        self.refl_err = refl_err;
        Ok(self)
    }

    pub fn with_flags(mut self, flag: Vec<u8>) -> Result<Self> {
        if flag.len() != self.wave.len() {
            return Err(Error::InvalidSpectrum(format!(
                "flag has {} values but wave has {}",
                flag.len(),
                self.wave.len()
            )));
        }
        self.flag = flag;
        Ok(self)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_number(mut self, number: u32) -> Self {
        self.number = Some(number);
        self
    }

    /// Attach a geometric albedo. Non-finite or non-positive values mean unknown.
    pub fn with_albedo(mut self, pv: f64) -> Self {
        self.pv = (pv.is_finite() && pv > 0.0).then_some(pv);
        self
    }

    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    pub fn refl(&self) -> &[f64] {
        &self.refl
    }

    pub fn refl_err(&self) -> &[f64] {
        &self.refl_err
    }

    pub fn flag(&self) -> &[u8] {
        &self.flag
    }

    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    /// Observed wavelength range, `(NaN, NaN)` for an empty spectrum.
    pub fn wave_range(&self) -> (f64, f64) {
        match (self.wave.first(), self.wave.last()) {
            (Some(lo), Some(hi)) => (*lo, *hi),
            _ => (f64::NAN, f64::NAN),
        }
    }

    /// Whether the observed range spans `[lo, hi]`.
    ///
    /// Grid limits are decimal literals, so a 1e-9 µm slack absorbs the
    /// representation error of e.g. `0.45 + 40 * 0.05`.
    pub fn covers(&self, lo: f64, hi: f64) -> bool {
        let (min, max) = self.wave_range();
        min <= lo + 1e-9 && max >= hi - 1e-9
    }

    /// Whether the preprocessing step for `scheme` has run.
    pub fn is_preprocessed(&self, scheme: Scheme) -> bool {
        match scheme {
            Scheme::Tholen => self.tholen.is_some(),
            Scheme::Demeo => self.demeo.is_some(),
            Scheme::Mahlke => self.mahlke.is_some(),
        }
    }

    /// The class label assigned under `scheme`, if classified.
    pub fn class(&self, scheme: Scheme) -> Option<&str> {
        match scheme {
            Scheme::Tholen => self.class_tholen.as_ref().map(|c| c.class.as_str()),
            Scheme::Demeo => self.class_demeo.as_ref().map(|c| c.class.as_str()),
            Scheme::Mahlke => self.class_mahlke.as_ref().map(|c| c.class.as_str()),
        }
    }

    /// Move the preprocessed and classified fields of `scheme` out, leaving
    /// them empty.
    pub(crate) fn take_scheme(&mut self, scheme: Scheme) -> SchemeFields {
        match scheme {
            Scheme::Tholen => SchemeFields::Tholen(self.tholen.take(), self.class_tholen.take()),
            Scheme::Demeo => SchemeFields::Demeo(self.demeo.take(), self.class_demeo.take()),
            Scheme::Mahlke => SchemeFields::Mahlke(self.mahlke.take(), self.class_mahlke.take()),
        }
    }

    pub(crate) fn restore_scheme(&mut self, fields: SchemeFields) {
        match fields {
            SchemeFields::Tholen(pre, class) => {
                self.tholen = pre;
                self.class_tholen = class;
            }
            SchemeFields::Demeo(pre, class) => {
                self.demeo = pre;
                self.class_demeo = class;
            }
            SchemeFields::Mahlke(pre, class) => {
                self.mahlke = pre;
                self.class_mahlke = class;
            }
        }
    }

    /// Label used in log lines: the name, else the number, else the source.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else if let Some(number) = self.number {
            format!("({number})")
        } else if !self.source.is_empty() {
            self.source.clone()
        } else {
            "unnamed".to_string()
        }
    }
}

/// Per-scheme fields of a [`Spectrum`], held aside while a scheme runs.
pub(crate) enum SchemeFields {
    Tholen(Option<tholen::Preprocessed>, Option<Classification>),
    Demeo(Option<demeo::Preprocessed>, Option<Classification>),
    Mahlke(Option<mahlke::Preprocessed>, Option<mahlke::MahlkeClassification>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_lengths() {
        let err = Spectrum::new(vec![0.5, 0.6], vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidSpectrum(_)));

        let spec = Spectrum::new(vec![0.5, 0.6], vec![1.0, 1.1]).unwrap();
        assert!(spec.clone().with_errors(vec![0.1]).is_err());
        assert!(spec.with_flags(vec![0, 0, 1]).is_err());
    }

    #[test]
    fn rejects_unordered_wavelengths() {
        assert!(Spectrum::new(vec![0.5, 0.5], vec![1.0, 1.0]).is_err());
        assert!(Spectrum::new(vec![0.6, 0.5], vec![1.0, 1.0]).is_err());
        assert!(Spectrum::new(vec![0.5, f64::NAN], vec![1.0, 1.0]).is_err());
    }

    #[test]
    fn defaults_fill_every_column() {
        let spec = Spectrum::new(vec![0.5, 0.6, 0.7], vec![1.0, 1.1, 1.2]).unwrap();
        assert_eq!(spec.refl_err().len(), 3);
        assert!(spec.refl_err().iter().all(|e| e.is_nan()));
        assert_eq!(spec.flag(), &[0, 0, 0]);
        assert!(!spec.is_preprocessed(Scheme::Demeo));
        assert_eq!(spec.class(Scheme::Tholen), None);
    }

    #[test]
    fn coverage_uses_observed_extremes() {
        let spec = Spectrum::new(vec![0.45, 1.0, 2.45], vec![1.0; 3]).unwrap();
        assert!(spec.covers(0.45, 2.45));
        assert!(!spec.covers(0.44, 2.45));
        assert!(!spec.covers(0.45, 2.5));
    }

    #[test]
    fn scheme_fields_round_trip() {
        let mut spec = Spectrum::new(vec![0.5], vec![1.0]).unwrap();
        spec.class_demeo = Some(Classification::insufficient_coverage((0.5, 0.5), (0.45, 2.45)));

        let saved = spec.take_scheme(Scheme::Demeo);
        assert_eq!(spec.class(Scheme::Demeo), None);
        spec.restore_scheme(saved);
        assert_eq!(spec.class(Scheme::Demeo), Some(""));
    }

    #[test]
    fn albedo_must_be_positive() {
        let spec = Spectrum::new(vec![0.5], vec![1.0]).unwrap();
        assert_eq!(spec.clone().with_albedo(0.2).pv, Some(0.2));
        assert_eq!(spec.clone().with_albedo(0.0).pv, None);
        assert_eq!(spec.with_albedo(f64::NAN).pv, None);
    }
}
