//! Per-record orchestration: questions → verification → assessment for each
//! evidence item in order, then one aggregation over all items.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::artifact::ResultRow;
use crate::config::Config;
use crate::dataset::{DatasetHandle, Record};
use crate::metrics;
use crate::prompts::Prompts;
use crate::redact::scrub;
use crate::retry::{RetryPolicy, Sleeper};
use crate::service::ReasoningService;
use crate::stages::{AssessmentScorer, Aggregator, QuestionGenerator, VerificationExecutor};

/// Outcome of one evidence item after all three stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub questions: Vec<String>,
    pub answer: String,
    pub assessment: String,
}

impl ItemResult {
    fn failed(questions: Vec<String>, answer: String, reason: impl std::fmt::Display) -> Self {
        Self {
            questions,
            answer,
            assessment: scrub(&format!("error processing evidence: {reason}")),
        }
    }
}

pub struct EvidencePipeline {
    questions: QuestionGenerator,
    executor: VerificationExecutor,
    scorer: AssessmentScorer,
    aggregator: Aggregator,
}

impl EvidencePipeline {
    pub fn new(
        config: &Config,
        service: Arc<dyn ReasoningService>,
        prompts: Arc<Prompts>,
        sleeper: Arc<dyn Sleeper>,
        dataset: Option<DatasetHandle>,
    ) -> Self {
        let executor = VerificationExecutor::new(
            service.clone(),
            prompts.clone(),
            RetryPolicy::from(&config.retry),
            sleeper,
        )
        .with_step_budget(config.pipeline.react_step_budget)
        .with_questions_per_batch(config.pipeline.questions_per_batch)
        .with_dataset(dataset);

        Self {
            questions: QuestionGenerator::new(
                service.clone(),
                prompts.clone(),
                config.pipeline.max_questions,
            ),
            executor,
            scorer: AssessmentScorer::new(service.clone(), prompts.clone()),
            aggregator: Aggregator::new(service, prompts),
        }
    }

    /// Always yields a row; stage failures become text in the row.
    #[instrument(skip(self, record), fields(iteration = record.iteration, items = record.evidence.len()))]
    pub async fn evaluate(&self, record: &Record) -> ResultRow {
        if record.evidence.is_empty() {
            info!("record has no evidence; skipping pipeline");
            return ResultRow::no_evidence(record.iteration);
        }

        let mut items = Vec::with_capacity(record.evidence.len());
        for (offset, evidence) in record.evidence.iter().enumerate() {
            items.push(self.process_item(offset + 1, evidence).await);
        }

        let assessments: Vec<String> = items.iter().map(|item| item.assessment.clone()).collect();
        let final_assessment = match self.aggregator.aggregate(&record.evidence, &assessments).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "aggregation failed");
                metrics::record_item_failure("aggregation");
                scrub(&format!("error aggregating assessments: {err}"))
            }
        };

        let mut row = ResultRow {
            iteration: record.iteration,
            evidence_count: record.evidence.len(),
            evidence_list: record.evidence.clone(),
            verification_questions: Vec::with_capacity(items.len()),
            verification_answers: Vec::with_capacity(items.len()),
            credibility_assessments: assessments,
            final_assessment,
        };
        for item in items {
            row.verification_questions.push(item.questions);
            row.verification_answers.push(item.answer);
        }
        row
    }

    /// `index` is 1-based.
    pub async fn process_item(&self, index: usize, evidence: &str) -> ItemResult {
        let questions = match self.questions.generate(index, evidence).await {
            Ok(questions) => questions,
            Err(err) => {
                warn!(evidence = index, error = %err, "question generation failed");
                metrics::record_item_failure("questions");
                return ItemResult::failed(Vec::new(), String::new(), err);
            }
        };

        let answer = self.executor.verify(index, evidence, &questions).await;
        if let Some(reason) = answer.failure() {
            return ItemResult::failed(questions, answer.transcript.clone(), reason);
        }

        match self.scorer.score(evidence, &answer).await {
            Ok(assessment) => ItemResult {
                questions,
                answer: answer.transcript,
                assessment,
            },
            Err(err) => {
                warn!(evidence = index, error = %err, "assessment failed");
                metrics::record_item_failure("assessment");
                ItemResult::failed(questions, answer.transcript, err)
            }
        }
    }
}
