//! Configuration for the `classy` binary and library defaults.
//!
//! Supports loading config from:
//! - an explicit TOML file (`--config`)
//! - ~/.config/classy/config.toml
//! - the `CLASSY_DATA_DIR` environment variable

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::preprocess::EXTRAPOLATION_LIMIT;
use crate::taxonomy::PreprocessOptions;

pub const DATA_DIR_ENV: &str = "CLASSY_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the reference data (ECAS table, MCFA model, library).
    pub data_dir: Option<PathBuf>,

    /// Smooth spectra before DeMeo preprocessing.
    pub smooth: bool,

    /// Maximum extrapolation when resampling, in percent of the grid span.
    pub extrapolation_limit: f64,

    /// Size of the rayon pool used for batch classification.
    pub threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: None,
            smooth: false,
            extrapolation_limit: EXTRAPOLATION_LIMIT,
            threads: None,
        }
    }
}

impl Config {
    /// Load from `path` if given, else from the user config file when it
    /// exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::user_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path),
                None => Ok(Config::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        anyhow::ensure!(
            config.extrapolation_limit >= 0.0,
            "{}: extrapolation_limit must not be negative",
            path.display()
        );
        Ok(config)
    }

    /// Get the user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("classy").join("config.toml"))
    }

    /// Reference data directory, by priority:
    /// 1. `data_dir` from the config file
    /// 2. `CLASSY_DATA_DIR`, when it names an existing directory
    /// 3. the user cache directory (`~/.cache/classy`)
    pub fn data_dir(&self) -> Result<PathBuf> {
        let env = std::env::var_os(DATA_DIR_ENV).map(PathBuf::from);
        self.resolve_data_dir(env, dirs::cache_dir())
    }

    fn resolve_data_dir(&self, env: Option<PathBuf>, cache: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Some(dir) = env.filter(|d| d.is_dir()) {
            return Ok(dir);
        }
        cache
            .map(|c| c.join("classy"))
            .context("could not determine a cache directory, set CLASSY_DATA_DIR")
    }

    pub fn preprocess_options(&self) -> PreprocessOptions {
        PreprocessOptions {
            smooth: self.smooth,
            extrapolation_limit: self.extrapolation_limit,
        }
    }
}
