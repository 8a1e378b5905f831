use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, AsArray, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    LargeListArray, ListArray, StringArray,
};
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{MetadataValue, Spectrum};

/// Columns holding one value per wavelength.
const ARRAY_COLUMNS: [&str; 4] = ["wave", "refl", "refl_err", "flag"];

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load spectra from a file.  Dispatch by extension.
///
/// Every format carries one spectrum per row / record:
/// * `wave`, `refl` – required arrays (µm, reflectance)
/// * `refl_err`, `flag` – optional arrays of the same length
/// * `name`, `number`, `source`, `pv` – optional identity and albedo
/// * anything else is kept as metadata
///
/// Supported formats:
/// * `.parquet` – list columns for the arrays (recommended)
/// * `.json`    – `[{ "wave": [...], "refl": [...], ...meta }, ...]`
/// * `.csv`     – array columns contain semicolon-separated floats
pub fn load_file(path: &Path) -> Result<Vec<Spectrum>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let spectra = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!("loaded {} spectra from {}", spectra.len(), path.display());
    Ok(spectra)
}

/// One parsed row before validation.
#[derive(Default)]
struct RawRecord {
    wave: Vec<f64>,
    refl: Vec<f64>,
    refl_err: Option<Vec<f64>>,
    flag: Option<Vec<f64>>,
    metadata: BTreeMap<String, MetadataValue>,
}

impl RawRecord {
    fn set_array(&mut self, column: &str, values: Vec<f64>) {
        match column {
            "wave" => self.wave = values,
            "refl" => self.refl = values,
            "refl_err" => self.refl_err = Some(values),
            "flag" => self.flag = Some(values),
            _ => {}
        }
    }

    /// Validate the arrays and lift the identity columns out of the metadata.
    fn into_spectrum(mut self, row: usize) -> Result<Spectrum> {
        let mut spec = Spectrum::new(self.wave, self.refl)
            .with_context(|| format!("Row {row}: invalid spectrum"))?;
        if let Some(refl_err) = self.refl_err {
            spec = spec
                .with_errors(refl_err)
                .with_context(|| format!("Row {row}: invalid 'refl_err'"))?;
        }
        if let Some(flag) = self.flag {
            // anything but an explicit 0 is degraded, NaN included
            let flag = flag.iter().map(|f| if *f == 0.0 { 0 } else { 1 }).collect();
            spec = spec
                .with_flags(flag)
                .with_context(|| format!("Row {row}: invalid 'flag'"))?;
        }

        match self.metadata.remove("name") {
            Some(MetadataValue::Null) | None => {}
            Some(value) => spec = spec.named(value.to_string()),
        }
        match self.metadata.remove("source") {
            Some(MetadataValue::Null) | None => {}
            Some(value) => spec = spec.with_source(value.to_string()),
        }
        if let Some(number) = self.metadata.remove("number").and_then(|v| v.as_f64()) {
            if number >= 1.0 && number.fract() == 0.0 && number <= u32::MAX as f64 {
                spec = spec.with_number(number as u32);
            }
        }
        if let Some(pv) = self.metadata.remove("pv").and_then(|v| v.as_f64()) {
            spec = spec.with_albedo(pv);
        }

        spec.metadata = self.metadata;
        Ok(spec)
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, the default `df.to_json(orient='records')`):
///
/// ```json
/// [
///   {
///     "wave": [0.45, 0.46, ...],
///     "refl": [0.98, 0.99, ...],
///     "name": "Ceres",
///     "pv": 0.09
///   },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<Vec<Spectrum>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root.as_array().context("Expected top-level JSON array")?;

    let mut spectra = Vec::with_capacity(records.len());

    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;

        let mut raw = RawRecord::default();
        for (key, val) in obj {
            if ARRAY_COLUMNS.contains(&key.as_str()) {
                raw.set_array(key, json_array_to_f64(Some(val), i, key)?);
            } else {
                raw.metadata.insert(key.clone(), json_to_metadata(val));
            }
        }
        if !obj.contains_key("wave") || !obj.contains_key("refl") {
            bail!("Row {i}: missing 'wave' or 'refl' array");
        }

        spectra.push(raw.into_spectrum(i)?);
    }

    Ok(spectra)
}

fn json_array_to_f64(val: Option<&JsonValue>, row: usize, col: &str) -> Result<Vec<f64>> {
    let arr = val
        .and_then(|v| v.as_array())
        .with_context(|| format!("Row {row}: missing or invalid '{col}' array"))?;

    arr.iter()
        .enumerate()
        .map(|(j, v)| match v {
            JsonValue::Null => Ok(f64::NAN),
            _ => v
                .as_f64()
                .with_context(|| format!("Row {row}, {col}[{j}]: not a number")),
        })
        .collect()
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => MetadataValue::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout:  header row with column names.
/// Array columns contain semicolon-separated floats:
///   `"0.45;0.46;0.47"`, `"0.98;0.99;1.0"`
/// All other columns are treated as metadata.
fn load_csv(path: &Path) -> Result<Vec<Spectrum>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    for required in ["wave", "refl"] {
        if !headers.iter().any(|h| h == required) {
            bail!("CSV missing '{required}' column");
        }
    }

    let mut spectra = Vec::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let mut raw = RawRecord::default();
        for (col_name, value) in headers.iter().zip(record.iter()) {
            if ARRAY_COLUMNS.contains(&col_name.as_str()) {
                if value.trim().is_empty() && col_name != "wave" && col_name != "refl" {
                    continue;
                }
                raw.set_array(col_name, parse_semicolon_floats(value, row_no, col_name)?);
            } else {
                raw.metadata
                    .insert(col_name.clone(), guess_metadata_type(value));
            }
        }

        spectra.push(raw.into_spectrum(row_no)?);
    }

    Ok(spectra)
}

fn parse_semicolon_floats(s: &str, row: usize, col: &str) -> Result<Vec<f64>> {
    s.split(';')
        .enumerate()
        .map(|(j, tok)| {
            tok.trim()
                .parse::<f64>()
                .with_context(|| format!("Row {row}, {col}[{j}]: '{tok}' is not a number"))
        })
        .collect()
}

fn guess_metadata_type(s: &str) -> MetadataValue {
    if s.is_empty() {
        return MetadataValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return MetadataValue::Float(f);
    }
    if s == "true" || s == "false" {
        return MetadataValue::Bool(s == "true");
    }
    MetadataValue::String(s.to_string())
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file containing spectra.
///
/// Expected schema:
/// - `wave`, `refl`: List<Float64> or LargeList<Float64>
/// - `refl_err`: optional List<Float64>, `flag`: optional List<Int*>
/// - Any other columns are treated as metadata (strings, ints, floats, bools)
///
/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<Vec<Spectrum>> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut spectra = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();
        let n_rows = batch.num_rows();

        for required in ["wave", "refl"] {
            if schema.index_of(required).is_err() {
                bail!("Parquet file missing '{required}' column");
            }
        }

        let columns: Vec<(usize, String)> = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(i, f)| (i, f.name().clone()))
            .collect();

        for row in 0..n_rows {
            let mut raw = RawRecord::default();
            for (col_idx, col_name) in &columns {
                let col_array = batch.column(*col_idx);
                if ARRAY_COLUMNS.contains(&col_name.as_str()) {
                    if col_array.is_null(row) {
                        continue;
                    }
                    let values = extract_f64_list(col_array, row)
                        .with_context(|| format!("Row {row}: failed to read '{col_name}'"))?;
                    raw.set_array(col_name, values);
                } else {
                    raw.metadata
                        .insert(col_name.clone(), extract_metadata_value(col_array, row));
                }
            }

            spectra.push(raw.into_spectrum(spectra.len())?);
        }
    }

    Ok(spectra)
}

// -- Parquet / Arrow helpers --

/// Extract a `Vec<f64>` from a List or LargeList column at the given row.
fn extract_f64_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f64>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    // Reflectances are floats, flags usually integers
    let values = values_array.as_any();
    if let Some(arr) = values.downcast_ref::<Float64Array>() {
        Ok(arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    } else if let Some(arr) = values.downcast_ref::<Float32Array>() {
        Ok(arr.iter().map(|v| v.map_or(f64::NAN, f64::from)).collect())
    } else if let Some(arr) = values.downcast_ref::<Int64Array>() {
        Ok(arr.iter().map(|v| v.map_or(f64::NAN, |i| i as f64)).collect())
    } else if let Some(arr) = values.downcast_ref::<Int32Array>() {
        Ok(arr.iter().map(|v| v.map_or(f64::NAN, f64::from)).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected a float or integer type",
            values_array.data_type()
        )
    }
}

/// Extract a single metadata value from an Arrow column at a given row.
fn extract_metadata_value(col: &Arc<dyn Array>, row: usize) -> MetadataValue {
    if col.is_null(row) {
        return MetadataValue::Null;
    }
    let any = col.as_any();
    match col.data_type() {
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map_or(MetadataValue::Null, |s| {
                MetadataValue::String(s.value(row).to_string())
            }),
        DataType::LargeUtf8 => MetadataValue::String(col.as_string::<i64>().value(row).to_string()),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map_or(MetadataValue::Null, |a| {
                MetadataValue::Integer(a.value(row) as i64)
            }),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map_or(MetadataValue::Null, |a| MetadataValue::Integer(a.value(row))),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map_or(MetadataValue::Null, |a| {
                MetadataValue::Float(a.value(row) as f64)
            }),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map_or(MetadataValue::Null, |a| MetadataValue::Float(a.value(row))),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map_or(MetadataValue::Null, |a| MetadataValue::Bool(a.value(row))),
        _ => MetadataValue::String(format!("{:?}", col.data_type())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Builder, Int64Builder, ListBuilder};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn json_records_become_spectra() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "spectra.json",
            r#"[{"wave":[0.5,0.6,0.7],"refl":[1.0,1.1,null],"flag":[0,0,1],
                 "name":"Vesta","number":4,"pv":0.42,"observer":"xyz"}]"#,
        );
        let spectra = load_file(&path).unwrap();
        assert_eq!(spectra.len(), 1);
        let spec = &spectra[0];
        assert_eq!(spec.name, "Vesta");
        assert_eq!(spec.number, Some(4));
        assert_eq!(spec.pv, Some(0.42));
        assert_eq!(spec.flag(), &[0, 0, 1]);
        assert!(spec.refl()[2].is_nan());
        assert_eq!(
            spec.metadata.get("observer"),
            Some(&MetadataValue::String("xyz".to_string()))
        );
        assert!(!spec.metadata.contains_key("name"));
    }

    #[test]
    fn any_nonzero_flag_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "spectra.json",
            r#"[{"wave":[0.5,0.6,0.7,0.8],"refl":[1.0,1.0,1.0,1.0],"flag":[0,-1,2,null]}]"#,
        );
        let spectra = load_file(&path).unwrap();
        assert_eq!(spectra[0].flag(), &[0, 1, 1, 1]);
    }

    #[test]
    fn csv_arrays_are_semicolon_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "spectra.csv",
            "name,wave,refl,refl_err,pv\n\
             Ceres,0.5;0.6;0.7,1.0;1.02;1.03,,\n\
             Pallas,0.5;0.6,0.9;1.0,0.01;0.01,0.15\n",
        );
        let spectra = load_file(&path).unwrap();
        assert_eq!(spectra.len(), 2);
        assert_eq!(spectra[0].len(), 3);
        assert_eq!(spectra[0].pv, None);
        assert!(spectra[0].refl_err().iter().all(|e| e.is_nan()));
        assert_eq!(spectra[1].refl_err(), &[0.01, 0.01]);
        assert_eq!(spectra[1].pv, Some(0.15));
    }

    #[test]
    fn invalid_rows_name_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "spectra.csv",
            "wave,refl\n0.5;0.6,1.0;1.0\n0.6;0.5,1.0;1.0\n",
        );
        let err = format!("{:#}", load_file(&path).unwrap_err());
        assert!(err.contains("Row 1"), "{err}");
    }

    #[test]
    fn missing_refl_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "spectra.csv", "wave\n0.5;0.6\n");
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn unsupported_extension() {
        assert!(load_file(Path::new("spectra.pkl")).is_err());
    }

    #[test]
    fn parquet_list_columns() {
        let mut wave = ListBuilder::new(Float64Builder::new());
        let mut refl = ListBuilder::new(Float64Builder::new());
        let mut flag = ListBuilder::new(Int64Builder::new());
        for (w, r, f) in [(0.5, 1.0, 0), (0.6, 1.1, 0), (0.7, 1.2, 1)] {
            wave.values().append_value(w);
            refl.values().append_value(r);
            flag.values().append_value(f);
        }
        wave.append(true);
        refl.append(true);
        flag.append(true);

        let wave = wave.finish();
        let refl = refl.finish();
        let flag = flag.finish();
        let name = StringArray::from(vec!["Eros"]);
        let number = Int64Array::from(vec![433]);

        let schema = Arc::new(Schema::new(vec![
            Field::new("wave", wave.data_type().clone(), true),
            Field::new("refl", refl.data_type().clone(), true),
            Field::new("flag", flag.data_type().clone(), true),
            Field::new("name", DataType::Utf8, true),
            Field::new("number", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(wave),
                Arc::new(refl),
                Arc::new(flag),
                Arc::new(name),
                Arc::new(number),
            ],
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra.parquet");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let spectra = load_file(&path).unwrap();
        assert_eq!(spectra.len(), 1);
        assert_eq!(spectra[0].name, "Eros");
        assert_eq!(spectra[0].number, Some(433));
        assert_eq!(spectra[0].wave(), &[0.5, 0.6, 0.7]);
        assert_eq!(spectra[0].flag(), &[0, 0, 1]);
    }
}
