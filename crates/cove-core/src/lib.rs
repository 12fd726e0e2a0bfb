//! Chain-of-verification evaluation of OSINT evidence.
//!
//! Each record's evidence items are turned into verification questions,
//! answered by a reasoning loop that can run analysis code against a reference
//! dataset, scored for credibility, and aggregated into one verdict. The batch
//! evaluator runs records concurrently and checkpoints after every record so an
//! interrupted run can resume.

pub mod artifact;
pub mod batch;
mod config;
pub mod dataset;
mod error;
pub mod eval;
pub mod events;
pub mod evidence;
mod metrics;
pub mod pipeline;
pub mod prompts;
mod redact;
pub mod retry;
pub mod sandbox;
mod security;
pub mod service;
pub mod stages;
pub mod state;
mod telemetry;

pub use artifact::{ResultRow, StoredRow};
pub use batch::{BatchEvaluator, BatchReport};
pub use config::{
    BatchConfig, Config, ConfigLoader, DatasetConfig, LoggingConfig, ModelConfig, ModelsConfig,
    PipelineConfig, RetryConfig, SandboxBackend, SandboxConfig,
};
pub use dataset::{DatasetHandle, DatasetSource, Iteration, JsonWorkbook, Record};
pub use error::{CoveError, ServiceError, StageError};
pub use eval::{Comparison, InconclusivePolicy, Verdict};
pub use events::{Event, EventCollector, RecordStatus};
pub use evidence::{EvidenceContent, EvidenceList};
pub use metrics::init_metrics_from_env;
pub use pipeline::EvidencePipeline;
pub use prompts::Prompts;
pub use redact::{Redacted, redact, scrub};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use security::{SecretValue, require_env};
pub use service::{
    CompletionRequest, Message, ReactRequest, ReasoningService, ResponseFormat, Role, Stage,
};
pub use state::{Checkpoint, EvaluationState};
pub use telemetry::{TelemetryOptions, init_telemetry};
