//! JSON Lines result artifact: one [`ResultRow`] per record, ordered by iteration.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dataset::Iteration;
use crate::error::CoveError;

pub const NO_EVIDENCE: &str = "No evidence to evaluate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub iteration: Iteration,
    pub evidence_count: usize,
    pub evidence_list: Vec<String>,
    /// Questions per evidence item.
    pub verification_questions: Vec<Vec<String>>,
    /// Transcript per evidence item.
    pub verification_answers: Vec<String>,
    #[serde(default)]
    pub credibility_assessments: Vec<String>,
    pub final_assessment: String,
}

impl ResultRow {
    pub fn no_evidence(iteration: Iteration) -> Self {
        Self::placeholder(iteration, NO_EVIDENCE)
    }

    /// Row written when a record could not be evaluated at all.
    pub fn placeholder(iteration: Iteration, final_assessment: impl Into<String>) -> Self {
        Self {
            iteration,
            evidence_count: 0,
            evidence_list: Vec::new(),
            verification_questions: Vec::new(),
            verification_answers: Vec::new(),
            credibility_assessments: Vec::new(),
            final_assessment: final_assessment.into(),
        }
    }
}

/// A row as it appears on disk. Rows read from an earlier run keep their exact bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub iteration: Iteration,
    line: String,
}

impl StoredRow {
    pub fn encode(row: &ResultRow) -> Result<Self, CoveError> {
        let line = serde_json::to_string(row).context("failed to serialise result row")?;
        Ok(Self {
            iteration: row.iteration,
            line,
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn decode(&self) -> Result<ResultRow, CoveError> {
        Ok(serde_json::from_str(&self.line).context("failed to parse result row")?)
    }
}

/// Read every row, rejecting the file on the first malformed line.
pub fn read_rows(path: &Path) -> Result<Vec<StoredRow>, CoveError> {
    let text = fs::read_to_string(path).map_err(|err| CoveError::artifact(path, err))?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let row: ResultRow = serde_json::from_str(line)
            .with_context(|| format!("line {} is not a result row", lineno + 1))
            .map_err(|err| CoveError::artifact(path, err))?;
        rows.push(StoredRow {
            iteration: row.iteration,
            line: line.to_string(),
        });
    }
    Ok(rows)
}

pub fn read_results(path: &Path) -> Result<Vec<ResultRow>, CoveError> {
    read_rows(path)?.iter().map(StoredRow::decode).collect()
}

/// Whole-file rewrite through a sibling temp file, so readers never see a partial artifact.
pub fn write_rows<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = &'a StoredRow>,
) -> Result<usize, CoveError> {
    let write = || -> anyhow::Result<usize> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = temp_path(path);
        let mut count = 0;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            for row in rows {
                file.write_all(row.line.as_bytes())?;
                file.write_all(b"\n")?;
                count += 1;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;
        Ok(count)
    };
    write().map_err(|err| CoveError::artifact(path, err))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results.jsonl".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Fresh artifact path for a new run.
pub fn default_destination(output_dir: &Path) -> PathBuf {
    output_dir.join(format!(
        "evaluation_results_{}.jsonl",
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}
