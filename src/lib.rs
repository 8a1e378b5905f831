//! Asteroid taxonomy from reflectance spectra.
//!
//! Classifies spectra following Tholen 1984, DeMeo+ 2009 and Mahlke+ 2022:
//!
//! ```no_run
//! use classy::{Classifier, PreprocessOptions, ReferenceData, Scheme, Spectrum};
//!
//! let classifier = Classifier::new(ReferenceData::from_dir("/data/classy"));
//! let wave: Vec<f64> = (0..=200).map(|i| 0.45 + 0.01 * i as f64).collect();
//! let refl = vec![1.0; wave.len()];
//! let mut spec = Spectrum::new(wave, refl)?.named("Vesta").with_albedo(0.42);
//!
//! classifier.run(&mut spec, Scheme::Demeo, &PreprocessOptions::default())?;
//! println!("{:?}", spec.class(Scheme::Demeo));
//! # Ok::<(), classy::Error>(())
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod mixture;
pub mod preprocess;
pub mod reference;
pub mod taxonomy;

pub use data::model::{MetadataValue, Spectrum};
pub use error::{Error, Result};
pub use reference::{FileSource, ReferenceData, ReferenceSource};
pub use taxonomy::{Classification, Classifier, PreprocessOptions, Resolution, Scheme};
