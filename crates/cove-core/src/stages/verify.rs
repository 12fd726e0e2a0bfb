use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::dataset::DatasetHandle;
use crate::error::{ServiceError, StageError};
use crate::metrics;
use crate::prompts::Prompts;
use crate::redact::scrub;
use crate::retry::{RetryPolicy, Sleeper};
use crate::service::{Message, ReactRequest, ReasoningService, Stage, last_assistant};

const VERIFY_TRIGGER: &str = "Please analyze the data to verify this claim.";
const NO_ANALYSIS: &str = "No analysis was performed";

/// How the transcript of one evidence item came about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Answered,
    /// A non-retryable failure, kept as the transcript text.
    Errored,
    /// Overload persisted through every attempt.
    Exhausted { attempts: u32 },
}

/// Consolidated transcript for one evidence item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationAnswer {
    pub evidence: usize,
    pub transcript: String,
    pub outcome: AnswerOutcome,
}

impl VerificationAnswer {
    /// `Some` when the item must not proceed to scoring.
    pub fn failure(&self) -> Option<&str> {
        match self.outcome {
            AnswerOutcome::Exhausted { .. } => Some(&self.transcript),
            _ => None,
        }
    }
}

/// Drives the reasoning loop for the questions of one evidence item.
pub struct VerificationExecutor {
    service: Arc<dyn ReasoningService>,
    prompts: Arc<Prompts>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    step_budget: usize,
    questions_per_batch: Option<usize>,
    dataset: Option<DatasetHandle>,
}

impl VerificationExecutor {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        prompts: Arc<Prompts>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            service,
            prompts,
            policy,
            sleeper,
            step_budget: 30,
            questions_per_batch: None,
            dataset: None,
        }
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    pub fn with_questions_per_batch(mut self, size: Option<usize>) -> Self {
        self.questions_per_batch = size.filter(|size| *size > 0);
        self
    }

    pub fn with_dataset(mut self, dataset: Option<DatasetHandle>) -> Self {
        self.dataset = dataset;
        self
    }

    /// Never fails: service errors end up in the returned transcript.
    #[instrument(skip(self, evidence, questions), fields(evidence = index, questions = questions.len()))]
    pub async fn verify(&self, index: usize, evidence: &str, questions: &[String]) -> VerificationAnswer {
        if questions.is_empty() {
            return VerificationAnswer {
                evidence: index,
                transcript: format!("Evidence {index}: no verification questions were generated."),
                outcome: AnswerOutcome::Answered,
            };
        }

        let batch_size = self.questions_per_batch.unwrap_or(questions.len());
        let mut sections = Vec::new();
        let mut outcome = AnswerOutcome::Answered;

        for (batch_no, batch) in questions.chunks(batch_size).enumerate() {
            let first = batch_no * batch_size;
            match self.run_batch(evidence, batch, first).await {
                Ok(answer) => sections.push(answer),
                Err(StageError::RetriesExhausted {
                    attempts,
                    last_error,
                }) => {
                    warn!(attempts, error = %last_error, "verification retries exhausted");
                    metrics::record_item_failure("retries_exhausted");
                    let failure = format!(
                        "Evidence {index}: verification failed after {attempts} attempt(s): {last_error}"
                    );
                    // earlier batches stay in the transcript ahead of the failure
                    let transcript = if sections.is_empty() {
                        failure
                    } else {
                        format!("Evidence {index}:\n{}\n\n{failure}", sections.join("\n\n"))
                    };
                    return VerificationAnswer {
                        evidence: index,
                        transcript: scrub(&transcript),
                        outcome: AnswerOutcome::Exhausted { attempts },
                    };
                }
                Err(err) => {
                    warn!(error = %err, "verification failed; recording error transcript");
                    sections.push(scrub(&format!("Error during verification: {err}")));
                    outcome = AnswerOutcome::Errored;
                }
            }
        }

        info!(batches = sections.len(), "verification finished");
        VerificationAnswer {
            evidence: index,
            transcript: format!("Evidence {index}:\n{}", sections.join("\n\n")),
            outcome,
        }
    }

    async fn run_batch(
        &self,
        evidence: &str,
        batch: &[String],
        first: usize,
    ) -> Result<String, StageError> {
        let numbered = batch
            .iter()
            .enumerate()
            .map(|(offset, question)| format!("{}. {question}", first + offset + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let data_path = self
            .dataset
            .as_ref()
            .map(|dataset| dataset.name.as_str())
            .unwrap_or("(none)");
        let request = ReactRequest {
            system: self.prompts.react(evidence, &numbered, data_path),
            messages: vec![Message::user(VERIFY_TRIGGER)],
            dataset: self.dataset.clone(),
            step_budget: self.step_budget,
        };

        let transcript = self.with_retry(request).await?;
        Ok(last_assistant(&transcript).unwrap_or(NO_ANALYSIS).to_string())
    }

    async fn with_retry(&self, request: ReactRequest) -> Result<Vec<Message>, StageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.service.react(request.clone()).await {
                Ok(messages) => return Ok(messages),
                Err(err) if err.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "reasoning service overloaded; backing off"
                    );
                    metrics::record_retry(Stage::Verification.as_str());
                    self.sleeper.sleep(delay).await;
                }
                Err(err @ ServiceError::Overloaded(_)) => {
                    return Err(StageError::RetriesExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(err) => return Err(StageError::Service(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::CompletionRequest;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with `errors` in order, then answers.
    struct FlakyService {
        errors: Mutex<Vec<ServiceError>>,
        calls: AtomicU32,
        systems: Mutex<Vec<String>>,
    }

    impl FlakyService {
        fn new(mut errors: Vec<ServiceError>) -> Arc<Self> {
            errors.reverse();
            Arc::new(Self {
                errors: Mutex::new(errors),
                calls: AtomicU32::new(0),
                systems: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningService for FlakyService {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, ServiceError> {
            unreachable!("executor only uses react")
        }

        async fn react(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.systems.lock().unwrap().push(request.system.clone());
            if let Some(err) = self.errors.lock().unwrap().pop() {
                return Err(err);
            }
            let mut messages = request.messages;
            messages.push(Message::assistant("answered"));
            Ok(messages)
        }
    }

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn executor(service: Arc<FlakyService>, sleeper: Arc<RecordingSleeper>) -> VerificationExecutor {
        VerificationExecutor::new(
            service,
            Arc::new(Prompts::default()),
            RetryPolicy::new(3, Duration::from_millis(100)),
            sleeper,
        )
    }

    /// Answers the first `healthy` calls, then reports overload forever.
    struct TiresAfter {
        healthy: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReasoningService for TiresAfter {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, ServiceError> {
            unreachable!("executor only uses react")
        }

        async fn react(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > self.healthy {
                return Err(ServiceError::Overloaded("529".into()));
            }
            let mut messages = request.messages;
            messages.push(Message::assistant(format!("batch answer {call}")));
            Ok(messages)
        }
    }

    #[tokio::test]
    async fn exhaustion_keeps_answers_from_earlier_batches() {
        let service = Arc::new(TiresAfter {
            healthy: 1,
            calls: AtomicU32::new(0),
        });
        let answer = VerificationExecutor::new(
            service.clone(),
            Arc::new(Prompts::default()),
            RetryPolicy::new(3, Duration::from_millis(100)),
            Arc::new(RecordingSleeper::default()),
        )
        .with_questions_per_batch(Some(1))
        .verify(2, "evidence", &questions(2))
        .await;

        assert_eq!(answer.outcome, AnswerOutcome::Exhausted { attempts: 3 });
        assert_eq!(service.calls.load(Ordering::SeqCst), 4);
        assert!(answer.transcript.starts_with("Evidence 2:\nbatch answer 1\n\n"));
        assert!(
            answer
                .transcript
                .contains("Evidence 2: verification failed after 3 attempt(s)")
        );
        assert!(answer.failure().is_some());
    }

    fn questions(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("question {i}")).collect()
    }

    #[tokio::test]
    async fn recovers_after_transient_overload() {
        let service = FlakyService::new(vec![ServiceError::Overloaded("529".into())]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let answer = executor(service.clone(), sleeper.clone())
            .verify(1, "evidence", &questions(2))
            .await;

        assert_eq!(answer.outcome, AnswerOutcome::Answered);
        assert_eq!(answer.transcript, "Evidence 1:\nanswered");
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sleeper.0.lock().unwrap(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn non_retryable_error_becomes_transcript() {
        let service = FlakyService::new(vec![ServiceError::failed("bad request")]);
        let answer = executor(service.clone(), Arc::default())
            .verify(2, "evidence", &questions(1))
            .await;

        assert_eq!(answer.outcome, AnswerOutcome::Errored);
        assert!(answer.failure().is_none());
        assert!(answer.transcript.contains("Error during verification"));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batches_are_numbered_continuously() {
        let service = FlakyService::new(Vec::new());
        let answer = executor(service.clone(), Arc::default())
            .with_questions_per_batch(Some(2))
            .verify(1, "evidence", &questions(3))
            .await;

        let systems = service.systems.lock().unwrap();
        assert_eq!(systems.len(), 2);
        assert!(systems[0].contains("1. question 1\n2. question 2"));
        assert!(systems[1].contains("3. question 3"));
        assert_eq!(answer.transcript, "Evidence 1:\nanswered\n\nanswered");
    }

    #[tokio::test]
    async fn no_questions_skips_the_service() {
        let service = FlakyService::new(Vec::new());
        let answer = executor(service.clone(), Arc::default())
            .verify(3, "evidence", &[])
            .await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert_eq!(answer.outcome, AnswerOutcome::Answered);
    }
}
