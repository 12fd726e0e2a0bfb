use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::config::{Config, ModelConfig};
use crate::error::{CoveError, ServiceError};
use crate::redact::scrub;
use crate::sandbox::SandboxExecutor;
use crate::security::SecretValue;

use super::react::ReactAgent;
use super::{CompletionRequest, Message, ReactRequest, ReasoningService, ResponseFormat, Stage};

const OVERLOAD_STATUSES: [u16; 3] = [429, 503, 529];

/// One chat-completion capable model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[Message], format: ResponseFormat)
    -> Result<String, ServiceError>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretValue,
    reasoning_effort: Option<String>,
    temperature: Option<f32>,
}

impl LlmClient {
    pub fn new(config: &ModelConfig, api_key: SecretValue) -> Result<Self, CoveError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| {
                CoveError::InvalidConfiguration(format!("failed to create HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key,
            reasoning_effort: config.reasoning_effort.clone(),
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn body(&self, messages: &[Message], format: ResponseFormat) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(effort) = &self.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if format == ResponseFormat::JsonObject {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    #[instrument(skip(self, messages), fields(model = %self.model, messages = messages.len()))]
    async fn chat(
        &self,
        messages: &[Message],
        format: ResponseFormat,
    ) -> Result<String, ServiceError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose())
            .json(&self.body(messages, format))
            .send()
            .await
            .map_err(|err| ServiceError::failed(format!("request failed: {err}")))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|err| ServiceError::failed(format!("failed to read response: {err}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_failure(status, &self.api_key.conceal(&text)));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|err| ServiceError::failed(format!("failed to parse response JSON: {err}")))?;
        let choice = json["choices"]
            .get(0)
            .ok_or_else(|| ServiceError::failed("response contained no choices"))?;

        // content may be null for refusals
        let content = choice["message"]["content"].as_str().unwrap_or("").to_string();
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

/// Map a non-success HTTP response onto the retryable/non-retryable split.
pub fn classify_failure(status: u16, body: &str) -> ServiceError {
    let snippet: String = scrub(body).chars().take(300).collect();
    let message = format!("HTTP {status}: {snippet}");
    if OVERLOAD_STATUSES.contains(&status) || body.to_ascii_lowercase().contains("overloaded") {
        ServiceError::Overloaded(message)
    } else {
        ServiceError::Failed(message)
    }
}

/// Production [`ReasoningService`]: one client per stage plus the reasoning loop.
pub struct LlmReasoningService {
    clients: HashMap<Stage, Arc<LlmClient>>,
    agent: ReactAgent,
}

impl LlmReasoningService {
    /// Builds every client up front so a missing credential fails the run before any record starts.
    pub fn from_config(
        config: &Config,
        sandbox: Arc<dyn SandboxExecutor>,
    ) -> Result<Self, CoveError> {
        let mut clients = HashMap::new();
        for (stage, secret) in config.require_credentials()? {
            let client = LlmClient::new(config.models.for_stage(stage), secret)?;
            clients.insert(stage, Arc::new(client));
        }
        let react_model = clients
            .get(&Stage::Verification)
            .cloned()
            .ok_or_else(|| CoveError::InvalidConfiguration("no model for react stage".into()))?;
        let agent = ReactAgent::new(react_model, sandbox, config.sandbox.timeout());
        Ok(Self { clients, agent })
    }

    fn client(&self, stage: Stage) -> Result<&Arc<LlmClient>, ServiceError> {
        self.clients
            .get(&stage)
            .ok_or_else(|| ServiceError::failed(format!("no model configured for {}", stage.as_str())))
    }
}

#[async_trait]
impl ReasoningService for LlmReasoningService {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError> {
        self.client(request.stage)?
            .chat(&request.messages, request.format)
            .await
    }

    async fn react(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError> {
        self.agent.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> LlmClient {
        let config = ModelConfig {
            base_url: base_url.to_string(),
            reasoning_effort: Some("high".into()),
            ..ModelConfig::default()
        };
        LlmClient::new(&config, SecretValue::new("sk-test")).unwrap()
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            client("https://api.openai.com/v1/").endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            client("http://localhost:1234").endpoint(),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            client("http://proxy/chat/completions").endpoint(),
            "http://proxy/chat/completions"
        );
    }

    #[test]
    fn body_carries_optional_fields() {
        let body = client("http://x/v1").body(&[Message::user("hi")], ResponseFormat::JsonObject);
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn overload_signals_are_retryable() {
        assert!(classify_failure(429, "rate limited").is_retryable());
        assert!(classify_failure(529, "").is_retryable());
        assert!(classify_failure(500, r#"{"error":{"type":"overloaded_error"}}"#).is_retryable());
        assert!(!classify_failure(400, "bad request").is_retryable());
        assert!(!classify_failure(401, "invalid key").is_retryable());
    }
}
