//! Dataset loading: rows from a sheet, chronological iteration numbering, evidence normalization.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::CoveError;
use crate::config::DatasetConfig;
use crate::evidence::{self, EvidenceList};

/// Stable identifier of a record within one dataset.
pub type Iteration = u64;

/// One spreadsheet row, column name to cell.
pub type Row = Map<String, Value>;

/// Column holding the assigned iteration in processed sheets.
pub const ITERATION_COLUMN: &str = "iteration";

/// One unit of work: the evidence to evaluate plus passthrough columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub iteration: Iteration,
    pub evidence: EvidenceList,
    #[serde(default)]
    pub metadata: Row,
}

/// Named reference data the analysis tool is allowed to run code against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHandle {
    pub name: String,
    pub path: PathBuf,
}

impl DatasetHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        Self { name, path }
    }
}

/// A tabular resource addressed by sheet name.
pub trait DatasetSource {
    fn sheet(&self, name: &str) -> Result<Vec<Row>, CoveError>;
}

/// JSON workbook: top-level object mapping sheet name to an array of row objects.
#[derive(Debug, Clone)]
pub struct JsonWorkbook {
    path: PathBuf,
}

impl JsonWorkbook {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetSource for JsonWorkbook {
    fn sheet(&self, name: &str) -> Result<Vec<Row>, CoveError> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| CoveError::config_io(self.path.clone(), err))?;
        let mut workbook: Map<String, Value> = serde_json::from_str(&raw).map_err(|err| {
            CoveError::Dataset(format!("{} is not a JSON workbook: {err}", self.path.display()))
        })?;
        let sheet = workbook.remove(name).ok_or_else(|| {
            let known: Vec<_> = workbook.keys().cloned().collect();
            CoveError::Dataset(format!(
                "sheet '{name}' not found in {} (sheets: {})",
                self.path.display(),
                known.join(", ")
            ))
        })?;
        let Value::Array(rows) = sheet else {
            return Err(CoveError::Dataset(format!("sheet '{name}' is not an array of rows")));
        };
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| match row {
                Value::Object(map) => Ok(map),
                _ => Err(CoveError::Dataset(format!(
                    "sheet '{name}' row {} is not an object",
                    idx + 1
                ))),
            })
            .collect()
    }
}

/// Records ready for evaluation plus the numbered sheet they came from.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub records: Vec<Record>,
    pub processed_rows: Vec<Row>,
}

/// Load a sheet, number its rows, and normalize the evidence column.
///
/// Rows that already carry an integer `iteration` keep it; otherwise rows are
/// sorted chronologically by the timestamp column and numbered from 1.
pub fn load_records(
    source: &dyn DatasetSource,
    sheet: &str,
    config: &DatasetConfig,
    limit: Option<usize>,
) -> Result<LoadedDataset, CoveError> {
    let rows = source.sheet(sheet)?;
    let already_numbered =
        !rows.is_empty() && rows.iter().all(|row| row.contains_key(ITERATION_COLUMN));
    let mut numbered = if already_numbered {
        existing_iterations(rows)?
    } else {
        assign_iterations(rows, &config.timestamp_column)?
    };
    numbered.sort_by_key(|(iteration, _)| *iteration);
    if let Some(limit) = limit {
        info!(limit, total = numbered.len(), "limiting evaluation to the first records");
        numbered.truncate(limit);
    }

    let mut records = Vec::with_capacity(numbered.len());
    let mut processed_rows = Vec::with_capacity(numbered.len());
    for (iteration, mut row) in numbered {
        row.insert(ITERATION_COLUMN.to_string(), Value::from(iteration));
        let cell = row.get(&config.evidence_column).cloned().unwrap_or(Value::Null);
        let evidence = evidence::normalize(&cell);
        debug!(iteration, evidence_count = evidence.len(), "record loaded");

        let mut metadata = row.clone();
        metadata.remove(&config.evidence_column);
        metadata.remove(ITERATION_COLUMN);
        records.push(Record {
            iteration,
            evidence,
            metadata,
        });
        processed_rows.push(row);
    }

    Ok(LoadedDataset {
        records,
        processed_rows,
    })
}

fn existing_iterations(rows: Vec<Row>) -> Result<Vec<(Iteration, Row)>, CoveError> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .map(|row| {
            let iteration = row
                .get(ITERATION_COLUMN)
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    CoveError::Dataset(format!(
                        "'{ITERATION_COLUMN}' must be a non-negative integer in every row"
                    ))
                })?;
            if !seen.insert(iteration) {
                return Err(CoveError::Dataset(format!("duplicate iteration {iteration}")));
            }
            Ok((iteration, row))
        })
        .collect()
}

/// Number rows 1..N in chronological order. Ties and missing timestamps keep sheet order,
/// missing timestamps sort last.
pub fn assign_iterations(
    rows: Vec<Row>,
    timestamp_column: &str,
) -> Result<Vec<(Iteration, Row)>, CoveError> {
    if let Some(first) = rows.first()
        && !first.contains_key(timestamp_column)
    {
        return Err(CoveError::Dataset(format!(
            "timestamp column '{timestamp_column}' not found"
        )));
    }

    let mut keyed = rows
        .into_iter()
        .enumerate()
        .map(|(idx, row)| {
            let cell = row.get(timestamp_column).unwrap_or(&Value::Null);
            let ts = parse_timestamp(cell).map_err(|reason| {
                CoveError::Dataset(format!("row {}: {reason}", idx + 1))
            })?;
            Ok((ts, row))
        })
        .collect::<Result<Vec<_>, CoveError>>()?;

    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    Ok(keyed
        .into_iter()
        .enumerate()
        .map(|(idx, (_, row))| (idx as Iteration + 1, row))
        .collect())
}

fn parse_timestamp(cell: &Value) -> Result<Option<NaiveDateTime>, String> {
    match cell {
        Value::Null => Ok(None),
        Value::Number(number) => {
            let secs = number
                .as_i64()
                .or_else(|| number.as_f64().map(|f| f as i64))
                .ok_or_else(|| format!("timestamp {number} out of range"))?;
            DateTime::from_timestamp(secs, 0)
                .map(|dt| Some(dt.naive_utc()))
                .ok_or_else(|| format!("timestamp {number} out of range"))
        }
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Ok(Some(dt.naive_utc()));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(Some(dt));
                }
            }
            for format in ["%Y-%m-%d", "%Y/%m/%d"] {
                if let Ok(date) = NaiveDate::parse_from_str(text, format) {
                    return Ok(date.and_hms_opt(0, 0, 0));
                }
            }
            Err(format!("unrecognised timestamp '{text}'"))
        }
        other => Err(format!("unsupported timestamp value {other}")),
    }
}

/// Persist the numbered sheet so later runs reuse the same iterations.
pub fn write_processed(path: &Path, sheet: &str, rows: &[Row]) -> Result<(), CoveError> {
    let mut workbook = Map::new();
    workbook.insert(
        sheet.to_string(),
        Value::Array(rows.iter().cloned().map(Value::Object).collect()),
    );
    let payload = serde_json::to_vec_pretty(&Value::Object(workbook))
        .map_err(|err| CoveError::Other(err.into()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| CoveError::config_io(parent.to_path_buf(), err))?;
    }
    fs::write(path, payload).map_err(|err| CoveError::config_io(path.to_path_buf(), err))?;
    info!(path = %path.display(), rows = rows.len(), "processed data saved");
    Ok(())
}
