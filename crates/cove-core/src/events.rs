//! Progress events emitted by the batch evaluator.
//!
//! Events are sent at the moment the corresponding transition happens, so a
//! receiver replaying them in order sees the real interleaving of records.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dataset::Iteration;

/// How a record left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Aggregated normally; individual items may still carry error text.
    Completed,
    /// Record had no evidence items to evaluate.
    NoEvidence,
    /// The pipeline failed outright and a placeholder row was written.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "completed",
            RecordStatus::NoEvidence => "no_evidence",
            RecordStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Record admitted to the run, waiting for a concurrency slot.
    RecordQueued { iteration: Iteration },
    /// Record already present in the resumed artifact.
    RecordSkipped { iteration: Iteration },
    /// Record acquired a slot and entered the pipeline.
    RecordStarted { iteration: Iteration, in_flight: usize },
    /// Record left the pipeline; its slot is released right after.
    RecordFinished {
        iteration: Iteration,
        status: RecordStatus,
        duration_ms: u64,
    },
    /// The artifact was rewritten with `rows` rows.
    Checkpointed { rows: usize },
}

/// Cheap cloneable handle used to publish events.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: Event) {
        // A dropped receiver only means nobody is watching progress.
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(event = ?err.0, "progress receiver closed");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (collector, mut receiver) = EventCollector::new();
        collector.emit(Event::RecordQueued { iteration: 1 });
        collector.emit(Event::RecordStarted {
            iteration: 1,
            in_flight: 1,
        });
        drop(collector);

        assert!(matches!(
            receiver.recv().await,
            Some(Event::RecordQueued { iteration: 1 })
        ));
        assert!(matches!(
            receiver.recv().await,
            Some(Event::RecordStarted { iteration: 1, .. })
        ));
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&Event::RecordFinished {
            iteration: 4,
            status: RecordStatus::NoEvidence,
            duration_ms: 12,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"record_finished","iteration":4,"status":"no_evidence","duration_ms":12}"#
        );
    }

    #[test]
    fn emitting_without_receiver_is_harmless() {
        let collector = EventCollector::default();
        collector.emit(Event::Checkpointed { rows: 3 });
    }
}
