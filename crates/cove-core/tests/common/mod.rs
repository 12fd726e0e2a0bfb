#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cove_core::{
    BatchEvaluator, CompletionRequest, Config, Event, EventCollector, EvidencePipeline, Message,
    Prompts, ReactRequest, ReasoningService, Record, ServiceError, Sleeper, Stage,
};
use tokio::sync::mpsc;

pub const PANIC_MARKER: &str = "TRIGGER-PANIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    /// Every reasoning loop reports overload.
    Overloaded,
    /// Every call fails without being retryable.
    Broken,
}

/// Canned reasoning service that counts calls and tracks overlapping loops.
pub struct StubService {
    mode: Mode,
    delay: Duration,
    questions: usize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub completions: AtomicUsize,
    pub react_calls: AtomicUsize,
}

impl StubService {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            questions: 4,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
            react_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn react_count(&self) -> usize {
        self.react_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for StubService {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if self.mode == Mode::Broken {
            return Err(ServiceError::failed("backend unavailable"));
        }
        let prompt = request
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        match request.stage {
            Stage::Questions => {
                if prompt.contains(PANIC_MARKER) {
                    panic!("stub asked to panic");
                }
                let questions: Vec<String> = (1..=self.questions)
                    .map(|n| format!("Question {n}?"))
                    .collect();
                Ok(serde_json::json!({ "verification_questions": questions }).to_string())
            }
            Stage::Assessment => {
                Ok(r#"{"final_result": "VERIFIED", "explanation": "answers agree"}"#.to_string())
            }
            Stage::Aggregation => {
                Ok(r#"{"final_result": "VERIFIED", "explanation": "all items agree"}"#.to_string())
            }
            Stage::Verification => Err(ServiceError::failed("unexpected completion stage")),
        }
    }

    async fn react(&self, request: ReactRequest) -> Result<Vec<Message>, ServiceError> {
        self.react_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.mode {
            Mode::Healthy => {
                let mut transcript = vec![Message::system(request.system)];
                transcript.extend(request.messages);
                transcript.push(Message::assistant("FINAL(the upload logs confirm it)"));
                transcript.push(Message::assistant("The upload logs confirm the claim."));
                Ok(transcript)
            }
            Mode::Overloaded => Err(ServiceError::Overloaded("529 overloaded".into())),
            Mode::Broken => Err(ServiceError::failed("backend unavailable")),
        }
    }
}

/// Records requested waits without sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    pub waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|waits| waits.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.max_questions = 3;
    config.retry.max_retries = 3;
    config.retry.retry_delay_ms = 10;
    config
}

pub fn pipeline(service: Arc<StubService>, sleeper: Arc<RecordingSleeper>) -> Arc<EvidencePipeline> {
    Arc::new(EvidencePipeline::new(
        &test_config(),
        service,
        Arc::new(Prompts::default()),
        sleeper,
        None,
    ))
}

pub fn evaluator(
    pipeline: Arc<EvidencePipeline>,
    concurrency: usize,
) -> (BatchEvaluator, mpsc::UnboundedReceiver<Event>) {
    let (collector, receiver) = EventCollector::new();
    (BatchEvaluator::new(pipeline, concurrency, collector), receiver)
}

pub fn record(iteration: u64, evidence: &[&str]) -> Record {
    Record {
        iteration,
        evidence: evidence.iter().map(|item| item.to_string()).collect(),
        metadata: Default::default(),
    }
}

/// `count` records, each with two evidence items.
pub fn records(count: u64) -> Vec<Record> {
    (1..=count)
        .map(|iteration| {
            let video = format!("Video of event {iteration} posted at 10:00");
            let photo = format!("Photo of event {iteration} geolocated to the square");
            record(iteration, &[video.as_str(), photo.as_str()])
        })
        .collect()
}

pub fn drain(receiver: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
