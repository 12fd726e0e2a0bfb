use std::sync::Arc;

use tracing::instrument;

use crate::error::StageError;
use crate::prompts::Prompts;
use crate::service::{CompletionRequest, ReasoningService, Stage};

use super::verify::VerificationAnswer;

/// Credibility judgment for one evidence item. The text is stored as-is.
pub struct AssessmentScorer {
    service: Arc<dyn ReasoningService>,
    prompts: Arc<Prompts>,
}

impl AssessmentScorer {
    pub fn new(service: Arc<dyn ReasoningService>, prompts: Arc<Prompts>) -> Self {
        Self { service, prompts }
    }

    #[instrument(skip(self, evidence, answer), fields(evidence = answer.evidence))]
    pub async fn score(&self, evidence: &str, answer: &VerificationAnswer) -> Result<String, StageError> {
        let prompt = self.prompts.assessment(evidence, &answer.transcript);
        let text = self
            .service
            .complete(CompletionRequest::json(Stage::Assessment, prompt))
            .await?;
        Ok(text.trim().to_string())
    }
}
