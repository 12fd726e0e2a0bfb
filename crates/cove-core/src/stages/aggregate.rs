use std::sync::Arc;

use tracing::instrument;

use crate::error::StageError;
use crate::prompts::Prompts;
use crate::service::{CompletionRequest, ReasoningService, Stage};

/// Combines every per-item assessment of a record into one verdict.
pub struct Aggregator {
    service: Arc<dyn ReasoningService>,
    prompts: Arc<Prompts>,
}

impl Aggregator {
    pub fn new(service: Arc<dyn ReasoningService>, prompts: Arc<Prompts>) -> Self {
        Self { service, prompts }
    }

    /// `assessments[i]` belongs to `evidence[i]`; both are numbered from 1 in the prompt.
    #[instrument(skip_all, fields(items = evidence.len()))]
    pub async fn aggregate(
        &self,
        evidence: &[String],
        assessments: &[String],
    ) -> Result<String, StageError> {
        let prompt = self.prompts.aggregation(
            &numbered("Evidence", evidence),
            &numbered("Assessment for evidence", assessments),
        );
        let text = self
            .service
            .complete(CompletionRequest::json(Stage::Aggregation, prompt))
            .await?;
        Ok(text.trim().to_string())
    }
}

fn numbered(label: &str, items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| format!("{label} {}: {item}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n\n")
}
