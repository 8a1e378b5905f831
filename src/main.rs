use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use classy::config::Config;
use classy::data::loader::load_file;
use classy::{Classifier, ReferenceData, Scheme, Spectrum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Table,
}

/// Classify asteroid reflectance spectra following Tholen 1984, DeMeo+ 2009
/// and Mahlke+ 2022.
#[derive(Debug, Parser)]
#[command(name = "classy", version)]
struct Cli {
    /// Spectra files (.parquet, .json, .csv)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Taxonomic scheme(s) to apply; all by default
    #[arg(short, long, value_enum)]
    scheme: Vec<Scheme>,

    /// Reference data directory (default: config file, then CLASSY_DATA_DIR,
    /// then the user cache directory)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Smooth spectra before DeMeo preprocessing
    #[arg(long)]
    smooth: bool,

    /// Maximum resampling extrapolation, in percent of the grid span
    #[arg(long)]
    extrapolation_limit: Option<f64>,

    /// Number of worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    #[arg(short, long, value_enum, default_value = "table")]
    format: Format,

    /// Log pipeline steps (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = merge(&cli, Config::load(cli.config.as_deref())?);

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .unwrap_or_else(|e| warn!("Failed to configure thread pool: {e}"));
    }

    let data_dir = config.data_dir()?;
    info!("reference data in {}", data_dir.display());
    let classifier = Classifier::new(ReferenceData::from_dir(data_dir));

    let schemes = if cli.scheme.is_empty() {
        Scheme::ALL.to_vec()
    } else {
        cli.scheme.clone()
    };

    let mut spectra = Vec::new();
    for path in &cli.files {
        spectra.extend(load_file(path)?);
    }

    let results = classifier.classify_all(&mut spectra, &schemes, &config.preprocess_options());
    let mut failed = 0;
    for (spec, outcomes) in spectra.iter().zip(&results) {
        let mut ok = true;
        for (scheme, result) in outcomes {
            if let Err(err) = result {
                error!("[{}] {scheme}: {err}", spec.label());
                ok = false;
            }
        }
        if !ok {
            failed += 1;
        }
    }

    match cli.format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&spectra).context("serializing results")?;
            println!("{json}");
        }
        Format::Table => print_table(&spectra, &schemes),
    }

    if failed > 0 {
        warn!("{failed} of {} spectra failed", spectra.len());
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Command-line values override the config file.
fn merge(cli: &Cli, mut config: Config) -> Config {
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }
    config.smooth |= cli.smooth;
    if let Some(limit) = cli.extrapolation_limit {
        config.extrapolation_limit = limit;
    }
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    config
}

fn print_table(spectra: &[Spectrum], schemes: &[Scheme]) {
    let width = spectra
        .iter()
        .map(|s| s.label().chars().count())
        .max()
        .unwrap_or(0)
        .max(4);

    let mut header = format!("{:<width$}", "name");
    for scheme in schemes {
        header.push_str(&format!("  {:>8}", scheme.key()));
    }
    println!("{header}");

    for spec in spectra {
        let mut line = format!("{:<width$}", spec.label());
        for &scheme in schemes {
            let class = match spec.class(scheme) {
                Some("") => "-",
                Some(class) => class,
                None => "?",
            };
            line.push_str(&format!("  {class:>8}"));
        }
        println!("{line}");
    }
}
