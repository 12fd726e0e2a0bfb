//! Reason/act/observe loop backed by the analysis sandbox.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::dataset::DatasetHandle;
use crate::error::ServiceError;
use crate::sandbox::{AnalysisRequest, SandboxExecutor};

use super::command::Action;
use super::llm::ChatModel;
use super::{Message, ReactRequest, ResponseFormat};

const OBSERVATION_LIMIT: usize = 4_000;

pub struct ReactAgent {
    model: Arc<dyn ChatModel>,
    sandbox: Arc<dyn SandboxExecutor>,
    tool_timeout: Duration,
}

impl ReactAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        sandbox: Arc<dyn SandboxExecutor>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            model,
            sandbox,
            tool_timeout,
        }
    }

    /// Runs until the model answers or `step_budget` model turns are spent.
    ///
    /// Running out of steps is a plain failure, never retryable.
    #[instrument(skip(self, request), fields(step_budget = request.step_budget))]
    pub async fn run(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError> {
        let mut transcript = Vec::with_capacity(request.messages.len() + 1);
        transcript.push(Message::system(request.system));
        transcript.extend(request.messages);

        for step in 1..=request.step_budget {
            let reply = self.model.chat(&transcript, ResponseFormat::Text).await?;
            match Action::parse(&reply) {
                Action::Final(answer) => {
                    info!(step, "reasoning loop produced final answer");
                    transcript.push(Message::assistant(answer));
                    return Ok(transcript);
                }
                Action::Respond => {
                    info!(step, "reasoning loop answered without tool call");
                    transcript.push(Message::assistant(reply));
                    return Ok(transcript);
                }
                Action::RunCode(code) => {
                    debug!(step, lines = code.lines().count(), "executing analysis code");
                    transcript.push(Message::assistant(reply));
                    let observation = self.observe(code, request.dataset.clone()).await;
                    transcript.push(Message::user(format!("Observation:\n{observation}")));
                }
            }
        }

        warn!(step_budget = request.step_budget, "reasoning loop exhausted step budget");
        Err(ServiceError::failed(format!(
            "reasoning loop stopped after {} steps without a final answer",
            request.step_budget
        )))
    }

    async fn observe(&self, code: String, dataset: Option<DatasetHandle>) -> String {
        let request = AnalysisRequest::new(code)
            .with_dataset(dataset)
            .with_timeout(self.tool_timeout);
        match self.sandbox.execute(request).await {
            Ok(output) => output.observation(OBSERVATION_LIMIT),
            Err(err) => {
                warn!(error = %err, "analysis tool failed");
                format!("Tool error: {err:#}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::AnalysisOutput;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, ServiceError>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(
            &self,
            _messages: &[Message],
            _format: ResponseFormat,
        ) -> Result<String, ServiceError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("```python\nprint('again')\n```".to_string()))
        }
    }

    struct EchoSandbox;

    #[async_trait]
    impl SandboxExecutor for EchoSandbox {
        async fn execute(&self, request: AnalysisRequest) -> anyhow::Result<AnalysisOutput> {
            if request.code.contains("boom") {
                anyhow::bail!("sandbox unavailable");
            }
            Ok(AnalysisOutput {
                exit_code: Some(0),
                stdout: format!("ran {} chars", request.code.len()),
                stderr: String::new(),
                timed_out: false,
                duration: Duration::ZERO,
            })
        }
    }

    fn request(step_budget: usize) -> ReactRequest {
        ReactRequest {
            system: "verify".into(),
            messages: vec![Message::user("Is the channel older than 2020?")],
            dataset: None,
            step_budget,
        }
    }

    #[tokio::test]
    async fn tool_call_then_final_answer() {
        let model = ScriptedModel::new(vec![
            Ok("Checking.\n```python\nprint(1)\n```".into()),
            Ok("```python\nboom()\n```".into()),
            Ok("FINAL(Channel created in 2018)".into()),
        ]);
        let agent = ReactAgent::new(model, Arc::new(EchoSandbox), Duration::from_secs(1));

        let transcript = agent.run(request(5)).await.unwrap();

        assert_eq!(transcript.len(), 7);
        assert_eq!(transcript[3].content, "Observation:\nran 8 chars");
        assert!(transcript[5].content.starts_with("Observation:\nTool error: sandbox unavailable"));
        assert_eq!(
            super::super::last_assistant(&transcript),
            Some("Channel created in 2018")
        );
    }

    #[tokio::test]
    async fn exhausted_budget_is_not_retryable() {
        let agent = ReactAgent::new(
            ScriptedModel::new(Vec::new()),
            Arc::new(EchoSandbox),
            Duration::from_secs(1),
        );
        let err = agent.run(request(3)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 steps"));
    }

    #[tokio::test]
    async fn model_errors_propagate_unchanged() {
        let model = ScriptedModel::new(vec![Err(ServiceError::Overloaded("529".into()))]);
        let agent = ReactAgent::new(model, Arc::new(EchoSandbox), Duration::from_secs(1));
        let err = agent.run(request(3)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
