//! Data layer: the spectrum type and file loading.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → Vec<Spectrum>
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │ Spectrum  │  wave / refl / refl_err / flag, identity, metadata,
//!   └──────────┘  per-scheme preprocessing and classification slots
//! ```

pub mod loader;
pub mod model;
