//! Reference data needed by the classifiers.
//!
//! ```text
//!   data_dir/
//!     ecas/ecas_scores.csv      Tholen: PCA scores of the ECAS asteroids
//!     mcfa/mcfa.json            Mahlke: mixture parameters + cluster rules
//!     mixnorm/neighbours.csv    Mahlke: normalization library
//! ```
//!
//! A [`ReferenceSource`] produces each resource; [`ReferenceData`] wraps a
//! source and builds every resource at most once, on first use.

use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::mixture::{Mcfa, McfaParams};
use crate::taxonomy::mahlke::{ClusterRule, LibrarySpectrum, MahlkeModel, NormLibrary};

pub const ECAS_SCORES: &str = "ecas/ecas_scores.csv";
pub const MCFA_MODEL: &str = "mcfa/mcfa.json";
pub const MIXNORM_LIBRARY: &str = "mixnorm/neighbours.csv";

/// One asteroid of the Eight Color Asteroid Survey reference table.
#[derive(Debug, Clone, PartialEq)]
pub struct EcasScores {
    pub number: Option<u32>,
    pub name: String,
    /// PC1 to PC7.
    pub scores: [f64; 7],
    /// Tholen class as published, possibly two letters.
    pub class: String,
}

/// Provider of the raw reference resources.
pub trait ReferenceSource: Send + Sync {
    fn tholen_table(&self) -> Result<Vec<EcasScores>>;
    fn mahlke_model(&self) -> Result<MahlkeModel>;
    fn mahlke_library(&self) -> Result<NormLibrary>;
}

// ---------------------------------------------------------------------------
// Files on disk
// ---------------------------------------------------------------------------

/// Reads the reference resources from a data directory.
#[derive(Debug, Clone)]
pub struct FileSource {
    data_dir: PathBuf,
}

fn unavailable(resource: &'static str, path: &Path, reason: impl ToString) -> Error {
    Error::ReferenceDataUnavailable {
        resource,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct EcasRow {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    number: Option<u32>,
    name: String,
    #[serde(rename = "PC1", deserialize_with = "csv::invalid_option")]
    pc1: Option<f64>,
    #[serde(rename = "PC2", deserialize_with = "csv::invalid_option")]
    pc2: Option<f64>,
    #[serde(rename = "PC3", deserialize_with = "csv::invalid_option")]
    pc3: Option<f64>,
    #[serde(rename = "PC4", deserialize_with = "csv::invalid_option")]
    pc4: Option<f64>,
    #[serde(rename = "PC5", deserialize_with = "csv::invalid_option")]
    pc5: Option<f64>,
    #[serde(rename = "PC6", deserialize_with = "csv::invalid_option")]
    pc6: Option<f64>,
    #[serde(rename = "PC7", deserialize_with = "csv::invalid_option")]
    pc7: Option<f64>,
    #[serde(rename = "class_")]
    class: String,
}

impl EcasRow {
    fn into_scores(self) -> Option<EcasScores> {
        let scores = [
            self.pc1?, self.pc2?, self.pc3?, self.pc4?, self.pc5?, self.pc6?, self.pc7?,
        ];
        if !scores.iter().all(|s| s.is_finite()) || self.class.trim().is_empty() {
            return None;
        }
        Some(EcasScores {
            number: self.number,
            name: self.name,
            scores,
            class: self.class.trim().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct McfaFile {
    #[serde(flatten)]
    params: McfaParams,
    rules: Vec<ClusterRule>,
}

impl FileSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        FileSource {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.data_dir.join(relative)
    }
}

impl ReferenceSource for FileSource {
    fn tholen_table(&self) -> Result<Vec<EcasScores>> {
        let path = self.path(ECAS_SCORES);
        let mut reader =
            csv::Reader::from_path(&path).map_err(|e| unavailable("ECAS scores", &path, e))?;

        let mut table = Vec::new();
        for (row, record) in reader.deserialize::<EcasRow>().enumerate() {
            let record = record
                .map_err(|e| unavailable("ECAS scores", &path, format!("row {row}: {e}")))?;
            match record.into_scores() {
                Some(scores) => table.push(scores),
                None => debug!("skipping ECAS row {row} without complete scores"),
            }
        }

        if table.is_empty() {
            return Err(unavailable("ECAS scores", &path, "no usable rows"));
        }
        Ok(table)
    }

    fn mahlke_model(&self) -> Result<MahlkeModel> {
        let path = self.path(MCFA_MODEL);
        let text =
            std::fs::read_to_string(&path).map_err(|e| unavailable("MCFA model", &path, e))?;
        let file: McfaFile =
            serde_json::from_str(&text).map_err(|e| unavailable("MCFA model", &path, e))?;

        let mixture = Mcfa::new(file.params).map_err(|e| unavailable("MCFA model", &path, e))?;
        MahlkeModel::new(Box::new(mixture), file.rules)
            .map_err(|e| unavailable("MCFA model", &path, e))
    }

    fn mahlke_library(&self) -> Result<NormLibrary> {
        let path = self.path(MIXNORM_LIBRARY);
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| unavailable("mixnorm library", &path, e))?;
        let headers = reader
            .headers()
            .map_err(|e| unavailable("mixnorm library", &path, e))?
            .clone();

        let mut entries = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record =
                record.map_err(|e| unavailable("mixnorm library", &path, format!("row {row}: {e}")))?;
            let mut fields = record.iter();
            let name = fields.next().unwrap_or_default().to_string();
            let refl = fields
                .enumerate()
                .map(|(i, cell)| {
                    let cell = cell.trim();
                    if cell.is_empty() {
                        return Ok(f64::NAN);
                    }
                    cell.parse::<f64>().map_err(|_| {
                        let column = headers.get(i + 1).unwrap_or_default();
                        unavailable(
                            "mixnorm library",
                            &path,
                            format!("row {row}, column '{column}': '{cell}' is not a number"),
                        )
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            entries.push(LibrarySpectrum { name, refl });
        }

        NormLibrary::new(entries).map_err(|e| unavailable("mixnorm library", &path, e))
    }
}

// ---------------------------------------------------------------------------
// Lazy bundle
// ---------------------------------------------------------------------------

/// Read-only reference bundle shared by every classification.
///
/// Each resource is built on first access; concurrent first accesses build it
/// once. A failed build is not cached, so a later call retries.
pub struct ReferenceData<S: ReferenceSource = FileSource> {
    source: S,
    tholen: OnceCell<Vec<EcasScores>>,
    mahlke_model: OnceCell<MahlkeModel>,
    mahlke_library: OnceCell<NormLibrary>,
}

impl ReferenceData<FileSource> {
    pub fn from_dir(data_dir: impl Into<PathBuf>) -> Self {
        ReferenceData::new(FileSource::new(data_dir))
    }
}

impl<S: ReferenceSource> ReferenceData<S> {
    pub fn new(source: S) -> Self {
        ReferenceData {
            source,
            tholen: OnceCell::new(),
            mahlke_model: OnceCell::new(),
            mahlke_library: OnceCell::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn tholen_table(&self) -> Result<&[EcasScores]> {
        self.tholen
            .get_or_try_init(|| {
                let table = self.source.tholen_table()?;
                info!("loaded {} ECAS reference asteroids", table.len());
                Ok(table)
            })
            .map(Vec::as_slice)
    }

    pub fn mahlke_model(&self) -> Result<&MahlkeModel> {
        self.mahlke_model.get_or_try_init(|| {
            let model = self.source.mahlke_model()?;
            info!(
                "loaded MCFA model with {} components and {} factors",
                model.mixture().n_components(),
                model.mixture().n_factors()
            );
            Ok(model)
        })
    }

    pub fn mahlke_library(&self) -> Result<&NormLibrary> {
        self.mahlke_library.get_or_try_init(|| {
            let library = self.source.mahlke_library()?;
            info!("loaded mixnorm library with {} spectra", library.len());
            Ok(library)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::taxonomy::mahlke::N_WAVE;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn reads_ecas_table_and_skips_incomplete_rows() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            ECAS_SCORES,
            "number,name,PC1,PC2,PC3,PC4,PC5,PC6,PC7,class_\n\
             1,Ceres,0.1,0.2,0.3,0.4,0.5,0.6,0.7,G\n\
             ,Unnumbered,1,1,1,1,1,1,1,CU\n\
             3,Juno,,1,1,1,1,1,1,S\n",
        );
        let table = FileSource::new(dir.path()).tholen_table().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].number, Some(1));
        assert_eq!(table[0].scores[6], 0.7);
        assert_eq!(table[1].number, None);
        assert_eq!(table[1].class, "CU");
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        match FileSource::new(dir.path()).tholen_table() {
            Err(Error::ReferenceDataUnavailable { resource, path, .. }) => {
                assert_eq!(resource, "ECAS scores");
                assert!(path.ends_with(ECAS_SCORES));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reads_mixnorm_library() {
        let dir = tempfile::tempdir().unwrap();
        let header: Vec<String> = (0..N_WAVE).map(|i| format!("refl{i}")).collect();
        let values = vec!["0.1"; N_WAVE].join(",");
        write(
            dir.path(),
            MIXNORM_LIBRARY,
            &format!("name,{}\nflat,{values}\n", header.join(",")),
        );
        let library = FileSource::new(dir.path()).mahlke_library().unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library.entries()[0].name, "flat");
        assert_eq!(library.entries()[0].refl.len(), N_WAVE);
    }

    #[test]
    fn library_cells_must_be_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let header: Vec<String> = (0..N_WAVE).map(|i| format!("refl{i}")).collect();
        let mut values = vec!["0.1"; N_WAVE];
        values[3] = "";
        write(
            dir.path(),
            MIXNORM_LIBRARY,
            &format!("name,{}
gaps,{}
", header.join(","), values.join(",")),
        );
        let library = FileSource::new(dir.path()).mahlke_library().unwrap();
        assert!(library.entries()[0].refl[3].is_nan());

        values[3] = "O.1";
        write(
            dir.path(),
            MIXNORM_LIBRARY,
            &format!("name,{}
corrupt,{}
", header.join(","), values.join(",")),
        );
        match FileSource::new(dir.path()).mahlke_library() {
            Err(Error::ReferenceDataUnavailable { reason, .. }) => {
                assert!(reason.contains("row 0, column 'refl3'"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_model_with_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            MCFA_MODEL,
            r#"{"weights":[1.0],"loadings":[[1.0]],"means":[[0.0]],
                "covariances":[[[1.0]]],"psi":[0.1],
                "rules":[{"kind":"class","class":"S"}]}"#,
        );
        assert!(matches!(
            FileSource::new(dir.path()).mahlke_model(),
            Err(Error::ReferenceDataUnavailable { .. })
        ));
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl ReferenceSource for CountingSource {
        fn tholen_table(&self) -> Result<Vec<EcasScores>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(Error::ReferenceDataUnavailable {
                    resource: "ECAS scores",
                    path: PathBuf::from("nowhere"),
                    reason: "not yet downloaded".to_string(),
                });
            }
            Ok(vec![EcasScores {
                number: Some(1),
                name: "Ceres".to_string(),
                scores: [0.0; 7],
                class: "G".to_string(),
            }])
        }

        fn mahlke_model(&self) -> Result<MahlkeModel> {
            unreachable!()
        }

        fn mahlke_library(&self) -> Result<NormLibrary> {
            unreachable!()
        }
    }

    #[test]
    fn failed_loads_are_retried_and_successes_cached() {
        let reference = ReferenceData::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        assert!(reference.tholen_table().is_err());
        assert_eq!(reference.tholen_table().unwrap().len(), 1);
        assert_eq!(reference.tholen_table().unwrap()[0].name, "Ceres");
        assert_eq!(reference.source().calls.load(Ordering::SeqCst), 2);
    }
}
