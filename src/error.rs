use std::path::PathBuf;

use thiserror::Error;

use crate::taxonomy::Scheme;

/// Errors raised by preprocessing, classification and reference-data loading.
///
/// Ambiguous or indeterminate decision-tree outcomes are *not* errors; they
/// are reported through [`crate::taxonomy::Resolution`] on the result.
#[derive(Debug, Error)]
pub enum Error {
    /// The spectrum's wavelength range does not span the scheme's grid.
    #[error(
        "[{name}] insufficient wavelength coverage for {scheme}: observed {:.3}-{:.3} µm, required {:.3}-{:.3} µm",
        observed.0, observed.1, required.0, required.1
    )]
    Coverage {
        scheme: Scheme,
        name: String,
        observed: (f64, f64),
        required: (f64, f64),
    },

    /// Classification was requested before the matching preprocessing ran.
    #[error("[{name}] classifying following {scheme} but the spectrum was not preprocessed for it")]
    PreprocessingOrder { scheme: Scheme, name: String },

    /// A reference table or model could not be constructed from its backing file.
    #[error("reference data '{resource}' unavailable at {}: {reason}", path.display())]
    ReferenceDataUnavailable {
        resource: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid spectrum: {0}")]
    InvalidSpectrum(String),

    #[error("mixture model: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, Error>;
