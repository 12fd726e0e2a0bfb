//! Batch evaluator: runs the evidence pipeline over every record of a dataset
//! with bounded concurrency, checkpointing after each completed record.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifact::ResultRow;
use crate::dataset::Record;
use crate::error::CoveError;
use crate::events::{Event, EventCollector, RecordStatus};
use crate::metrics;
use crate::pipeline::EvidencePipeline;
use crate::redact::scrub;
use crate::state::Checkpoint;

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub destination: PathBuf,
    pub total_records: usize,
    pub skipped: usize,
    pub completed: usize,
    pub no_evidence: usize,
    pub failed: usize,
    /// Rows in the artifact after the final write.
    pub rows: usize,
    /// Records never launched because shutdown was requested.
    pub not_started: usize,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn evaluated(&self) -> usize {
        self.completed + self.no_evidence + self.failed
    }
}

pub struct BatchEvaluator {
    pipeline: Arc<EvidencePipeline>,
    concurrency: usize,
    events: EventCollector,
    shutdown: Option<watch::Receiver<bool>>,
}

impl BatchEvaluator {
    pub fn new(pipeline: Arc<EvidencePipeline>, concurrency: usize, events: EventCollector) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            events,
            shutdown: None,
        }
    }

    /// Once the receiver reads `true`, no further records are launched.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn run(
        &self,
        records: Vec<Record>,
        checkpoint: Arc<Checkpoint>,
    ) -> Result<BatchReport, CoveError> {
        let start = Instant::now();
        let mut report = BatchReport {
            destination: checkpoint.destination().to_path_buf(),
            total_records: records.len(),
            ..BatchReport::default()
        };

        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            if checkpoint.is_completed(record.iteration).await {
                self.events.emit(Event::RecordSkipped {
                    iteration: record.iteration,
                });
                report.skipped += 1;
            } else {
                self.events.emit(Event::RecordQueued {
                    iteration: record.iteration,
                });
                pending.push(record);
            }
        }

        info!(
            total = report.total_records,
            skipped = report.skipped,
            pending = pending.len(),
            concurrency = self.concurrency,
            "starting batch evaluation"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        let mut queue = pending.into_iter();

        while let Some(record) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(self.shutdown.clone()) => {
                    report.not_started = 1 + queue.len();
                    warn!(not_started = report.not_started, "shutdown requested; no new records will start");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|err| CoveError::Other(err.into()))?
                }
            };

            let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.emit(Event::RecordStarted {
                iteration: record.iteration,
                in_flight: running,
            });

            let pipeline = self.pipeline.clone();
            let checkpoint = checkpoint.clone();
            let events = self.events.clone();
            let in_flight = in_flight.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let (row, status) = evaluate_guarded(&pipeline, &record).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                metrics::record_completion(status.as_str(), duration_ms, row.evidence_count);

                in_flight.fetch_sub(1, Ordering::SeqCst);
                events.emit(Event::RecordFinished {
                    iteration: record.iteration,
                    status,
                    duration_ms,
                });

                let committed = checkpoint.commit(&row).await;
                if let Ok(rows) = &committed {
                    events.emit(Event::Checkpointed { rows: *rows });
                }
                drop(permit);
                committed.map(|_| status)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(RecordStatus::Completed)) => report.completed += 1,
                Ok(Ok(RecordStatus::NoEvidence)) => report.no_evidence += 1,
                Ok(Ok(RecordStatus::Failed)) => report.failed += 1,
                Ok(Err(err)) => {
                    error!(error = %err, "failed to persist record result");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    error!(error = %err, "record task aborted");
                    if first_error.is_none() {
                        first_error = Some(CoveError::Other(err.into()));
                    }
                }
            }
        }

        report.rows = checkpoint.flush().await?;
        self.events.emit(Event::Checkpointed { rows: report.rows });
        report.duration_ms = start.elapsed().as_millis() as u64;

        if let Some(err) = first_error {
            return Err(err);
        }

        info!(
            completed = report.completed,
            no_evidence = report.no_evidence,
            failed = report.failed,
            rows = report.rows,
            duration_ms = report.duration_ms,
            destination = %report.destination.display(),
            "batch evaluation finished"
        );
        Ok(report)
    }
}

/// Runs the pipeline, converting a panic into a placeholder row.
async fn evaluate_guarded(pipeline: &EvidencePipeline, record: &Record) -> (ResultRow, RecordStatus) {
    match AssertUnwindSafe(pipeline.evaluate(record)).catch_unwind().await {
        Ok(row) if row.evidence_count == 0 => (row, RecordStatus::NoEvidence),
        Ok(row) => (row, RecordStatus::Completed),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(iteration = record.iteration, reason = %reason, "record pipeline panicked");
            let row = ResultRow::placeholder(
                record.iteration,
                scrub(&format!("Error processing record: {reason}")),
            );
            (row, RecordStatus::Failed)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = shutdown
        && rx.wait_for(|stop| *stop).await.is_ok()
    {
        return;
    }
    std::future::pending::<()>().await
}
