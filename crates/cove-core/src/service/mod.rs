//! Boundary to the external reasoning service.
//!
//! The pipeline only talks to [`ReasoningService`]. Production wiring lives in
//! [`llm::LlmReasoningService`]; tests substitute deterministic stubs.

pub mod command;
pub mod llm;
pub mod react;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetHandle;
use crate::error::ServiceError;

/// Pipeline stage a request belongs to; implementations route models by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Questions,
    Verification,
    Assessment,
    Aggregation,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Questions,
        Stage::Verification,
        Stage::Assessment,
        Stage::Aggregation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Questions => "questions",
            Stage::Verification => "react",
            Stage::Assessment => "assessment",
            Stage::Aggregation => "aggregation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Content of the last assistant-authored message, if any.
pub fn last_assistant(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
        .map(|message| message.content.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// The reply must be a single JSON object.
    JsonObject,
}

/// Single-shot text completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub stage: Stage,
    pub messages: Vec<Message>,
    pub format: ResponseFormat,
}

impl CompletionRequest {
    pub fn text(stage: Stage, prompt: impl Into<String>) -> Self {
        Self {
            stage,
            messages: vec![Message::user(prompt)],
            format: ResponseFormat::Text,
        }
    }

    pub fn json(stage: Stage, prompt: impl Into<String>) -> Self {
        Self {
            format: ResponseFormat::JsonObject,
            ..Self::text(stage, prompt)
        }
    }
}

/// Reason/act/observe run with code execution against `dataset`.
#[derive(Debug, Clone)]
pub struct ReactRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub dataset: Option<DatasetHandle>,
    pub step_budget: usize,
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError>;

    /// Returns the full message transcript of the run.
    async fn react(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError>;
}
