use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::StageError;
use crate::prompts::Prompts;
use crate::service::{CompletionRequest, ReasoningService, Stage};

/// Asks the service for at most `max_questions` verification questions per evidence item.
pub struct QuestionGenerator {
    service: Arc<dyn ReasoningService>,
    prompts: Arc<Prompts>,
    max_questions: usize,
}

impl QuestionGenerator {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        prompts: Arc<Prompts>,
        max_questions: usize,
    ) -> Self {
        Self {
            service,
            prompts,
            max_questions,
        }
    }

    #[instrument(skip(self, evidence), fields(evidence = index))]
    pub async fn generate(&self, index: usize, evidence: &str) -> Result<Vec<String>, StageError> {
        let prompt = self.prompts.questions(evidence, self.max_questions);
        let raw = self
            .service
            .complete(CompletionRequest::json(Stage::Questions, prompt))
            .await?;

        let mut questions = parse_questions(&raw).map_err(|reason| StageError::StructuralParse {
            evidence: index,
            reason,
        })?;
        if questions.len() > self.max_questions {
            debug!(
                proposed = questions.len(),
                kept = self.max_questions,
                "truncating verification questions"
            );
            questions.truncate(self.max_questions);
        }
        Ok(questions)
    }
}

/// Accepts `{"verification_questions": [...]}` or a bare array, optionally fenced.
///
/// Items may be strings or objects carrying a `text` field. Blank questions are
/// dropped; any other item shape rejects the whole reply.
pub fn parse_questions(raw: &str) -> Result<Vec<String>, String> {
    let body = strip_fence(raw.trim());
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_str(body).map_err(|err| format!("reply is not valid JSON: {err}"))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("verification_questions") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(format!(
                    "verification_questions must be a list, got {}",
                    type_name(&other)
                ));
            }
            None => return Err("reply has no verification_questions field".to_string()),
        },
        other => {
            return Err(format!(
                "expected a list of questions, got {}",
                type_name(&other)
            ));
        }
    };

    let mut questions = Vec::with_capacity(items.len());
    for (position, item) in items.into_iter().enumerate() {
        let text = match item {
            Value::String(text) => text,
            Value::Object(mut map) => match map.remove("text") {
                Some(Value::String(text)) => text,
                _ => return Err(format!("question {} has no text field", position + 1)),
            },
            other => {
                return Err(format!(
                    "question {} is {}, not a string",
                    position + 1,
                    type_name(&other)
                ));
            }
        };
        let text = text.trim();
        if !text.is_empty() {
            questions.push(text.to_string());
        }
    }
    Ok(questions)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
