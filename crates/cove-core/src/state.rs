//! Completed-record bookkeeping and checkpoint persistence for a batch run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifact::{self, ResultRow, StoredRow};
use crate::dataset::Iteration;
use crate::error::CoveError;

/// Rows completed so far, keyed by iteration.
///
/// Rows carried over from an earlier run are authoritative: a later row for
/// the same iteration is ignored, never substituted.
#[derive(Debug, Clone, Default)]
pub struct EvaluationState {
    rows: BTreeMap<Iteration, StoredRow>,
}

impl EvaluationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an earlier artifact. Duplicate iterations keep their first occurrence.
    pub fn from_prior(prior: Vec<StoredRow>) -> Self {
        let mut state = Self::new();
        for row in prior {
            let iteration = row.iteration;
            if !state.insert(row) {
                warn!(iteration, "duplicate iteration in prior artifact; keeping first row");
            }
        }
        state
    }

    /// Where to write and what is already done, given an optional `continue_from` artifact.
    ///
    /// A missing `continue_from` starts fresh in `output_dir`; an unreadable one is fatal.
    pub fn resume(
        continue_from: Option<&Path>,
        output_dir: &Path,
    ) -> Result<(PathBuf, Self), CoveError> {
        match continue_from {
            Some(path) if path.exists() => {
                let state = Self::from_prior(artifact::read_rows(path)?);
                info!(
                    path = %path.display(),
                    completed = state.len(),
                    "resuming from prior results"
                );
                Ok((path.to_path_buf(), state))
            }
            Some(path) => {
                let destination = artifact::default_destination(output_dir);
                warn!(
                    missing = %path.display(),
                    destination = %destination.display(),
                    "continue-from artifact not found; starting a fresh run"
                );
                Ok((destination, Self::new()))
            }
            None => Ok((artifact::default_destination(output_dir), Self::new())),
        }
    }

    pub fn is_completed(&self, iteration: Iteration) -> bool {
        self.rows.contains_key(&iteration)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns `false` when the iteration was already present.
    fn insert(&mut self, row: StoredRow) -> bool {
        match self.rows.entry(row.iteration) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(row);
                true
            }
        }
    }

    pub fn record(&mut self, row: &ResultRow) -> Result<bool, CoveError> {
        if self.is_completed(row.iteration) {
            warn!(iteration = row.iteration, "record already completed; keeping existing row");
            return Ok(false);
        }
        Ok(self.insert(StoredRow::encode(row)?))
    }

    /// Rows in iteration order.
    pub fn rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.values()
    }

    pub fn completed(&self) -> impl Iterator<Item = Iteration> + '_ {
        self.rows.keys().copied()
    }
}

/// Serialises `record + rewrite` so concurrent completions never interleave writes.
#[derive(Debug)]
pub struct Checkpoint {
    destination: PathBuf,
    state: Mutex<EvaluationState>,
}

impl Checkpoint {
    pub fn new(destination: PathBuf, state: EvaluationState) -> Self {
        Self {
            destination,
            state: Mutex::new(state),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn is_completed(&self, iteration: Iteration) -> bool {
        self.state.lock().await.is_completed(iteration)
    }

    /// Add `row` and rewrite the artifact; returns the number of rows written.
    pub async fn commit(&self, row: &ResultRow) -> Result<usize, CoveError> {
        let mut state = self.state.lock().await;
        state.record(row)?;
        artifact::write_rows(&self.destination, state.rows())
    }

    /// Rewrite the artifact with whatever is currently recorded.
    pub async fn flush(&self) -> Result<usize, CoveError> {
        let state = self.state.lock().await;
        artifact::write_rows(&self.destination, state.rows())
    }

    pub async fn snapshot(&self) -> EvaluationState {
        self.state.lock().await.clone()
    }
}
