use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cove_core::dataset::{self, DatasetHandle, JsonWorkbook};
use cove_core::service::llm::LlmReasoningService;
use cove_core::{
    BatchEvaluator, Checkpoint, ConfigLoader, EvaluationState, Event, EventCollector,
    EvidencePipeline, InconclusivePolicy, Prompts, TelemetryOptions, TokioSleeper, artifact, eval,
    init_metrics_from_env, init_telemetry, sandbox,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "cove",
    version,
    about = "Chain-of-verification evaluation of OSINT evidence"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate every record of a sheet and write a results artifact.
    Evaluate(EvaluateArgs),
    /// Compare a results artifact against human labels.
    Compare(CompareArgs),
    /// Print the first final assessments of a results artifact.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// JSON workbook holding the records.
    #[arg(long)]
    input: PathBuf,

    /// Sheet to evaluate.
    #[arg(long)]
    sheet: String,

    /// Column used to number records chronologically (overrides config).
    #[arg(long)]
    timestamp_column: Option<String>,

    /// Column holding the evidence (overrides config).
    #[arg(long)]
    evidence_column: Option<String>,

    /// Directory for the results artifact and the processed sheet.
    #[arg(long, default_value = "data")]
    output_dir: PathBuf,

    /// Maximum records evaluated at once (overrides config).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only evaluate the first N records.
    #[arg(long)]
    limit: Option<usize>,

    /// Earlier results artifact to resume; it is also the destination.
    #[arg(long)]
    continue_from: Option<PathBuf>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CompareArgs {
    /// Results artifact produced by `evaluate`.
    #[arg(long)]
    results: PathBuf,

    /// JSON workbook holding the human labels.
    #[arg(long)]
    labels: PathBuf,

    /// Sheet holding the labels.
    #[arg(long)]
    sheet: String,

    #[arg(long, default_value = "human_eval")]
    label_column: String,

    #[arg(long, default_value = "Iterations")]
    iteration_column: String,

    /// Leave inconclusive verdicts out of the agreement figure instead of counting them as fail.
    #[arg(long)]
    exclude_inconclusive: bool,

    /// Write the full comparison as JSON.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Results artifact produced by `evaluate`.
    #[arg(long)]
    results: PathBuf,

    #[arg(long, default_value_t = 5)]
    limit: usize,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Evaluate(args) => evaluate_command(args).await?,
            Command::Compare(args) => compare_command(args)?,
            Command::Inspect(args) => inspect_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn evaluate_command(args: EvaluateArgs) -> Result<()> {
    let mut config = ConfigLoader::load(args.config.clone())?;
    if let Some(column) = args.timestamp_column {
        config.dataset.timestamp_column = column;
    }
    if let Some(column) = args.evidence_column {
        config.dataset.evidence_column = column;
    }
    if let Some(concurrency) = args.concurrency {
        config.batch.concurrency = concurrency;
    }
    ConfigLoader::validate(&config)?;

    init_telemetry(TelemetryOptions::from_logging(&config.logging))?;
    init_metrics_from_env("cove");

    let executor = sandbox::build_executor(&config.sandbox)?;
    let service = Arc::new(LlmReasoningService::from_config(&config, executor)?);

    let workbook = JsonWorkbook::open(&args.input);
    let loaded = dataset::load_records(&workbook, &args.sheet, &config.dataset, args.limit)?;
    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("failed to create output directory {}", args.output_dir.display())
    })?;
    let processed_path = args.output_dir.join(format!(
        "processed_data_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    dataset::write_processed(&processed_path, &args.sheet, &loaded.processed_rows)?;

    let (destination, state) =
        EvaluationState::resume(args.continue_from.as_deref(), &args.output_dir)?;
    let checkpoint = Arc::new(Checkpoint::new(destination, state));

    let reference = config
        .dataset
        .reference
        .clone()
        .unwrap_or_else(|| workbook.path().to_path_buf());
    let prompts = Prompts::load(config.pipeline.prompts_dir.as_deref())?;
    let pipeline = Arc::new(EvidencePipeline::new(
        &config,
        service,
        Arc::new(prompts),
        Arc::new(TokioSleeper),
        Some(DatasetHandle::new(reference)),
    ));

    let (collector, receiver) = EventCollector::new();
    let progress = tokio::spawn(render_progress(receiver));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, shutdown_tx).await {
            std::process::exit(130);
        }
    });

    info!(
        records = loaded.records.len(),
        destination = %checkpoint.destination().display(),
        "evaluation starting"
    );
    let evaluator = BatchEvaluator::new(pipeline, config.batch.concurrency, collector)
        .with_shutdown(shutdown_rx);
    let report = evaluator.run(loaded.records, checkpoint).await;
    drop(evaluator);
    let _ = progress.await;
    let report = report?;

    println!("Results written to {}", report.destination.display());
    println!(
        "{} evaluated ({} completed, {} without evidence, {} failed), {} skipped, {} rows total",
        report.evaluated(),
        report.completed,
        report.no_evidence,
        report.failed,
        report.skipped,
        report.rows
    );
    if report.not_started > 0 {
        println!(
            "Interrupted: {} records not started; rerun with --continue-from {}",
            report.not_started,
            report.destination.display()
        );
    }
    Ok(())
}

/// First interrupt drains in-flight records. Returns `true` on a second interrupt.
async fn watch_interrupts<F, Fut>(mut next_interrupt: F, shutdown: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return false;
    }
    warn!("interrupt received; finishing in-flight records (interrupt again to abort)");
    let _ = shutdown.send(true);

    if next_interrupt().await.is_err() {
        return false;
    }
    warn!("second interrupt received; aborting without waiting for in-flight records");
    true
}

async fn render_progress(mut events: mpsc::UnboundedReceiver<Event>) {
    let mut queued = 0usize;
    let mut finished = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            Event::RecordQueued { .. } => queued += 1,
            Event::RecordSkipped { iteration } => {
                eprintln!("skip  iteration {iteration} (already in results)");
            }
            Event::RecordStarted {
                iteration,
                in_flight,
            } => {
                eprintln!("start iteration {iteration} ({in_flight} in flight)");
            }
            Event::RecordFinished {
                iteration,
                status,
                duration_ms,
            } => {
                finished += 1;
                eprintln!(
                    "[{finished}/{queued}] iteration {iteration} {} in {:.1}s",
                    status.as_str(),
                    duration_ms as f64 / 1000.0
                );
            }
            Event::Checkpointed { .. } => {}
        }
    }
}

fn compare_command(args: CompareArgs) -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let results = artifact::read_results(&args.results)?;
    let workbook = JsonWorkbook::open(&args.labels);
    let labels = eval::load_labels(
        &workbook,
        &args.sheet,
        &args.iteration_column,
        &args.label_column,
    )?;
    let policy = if args.exclude_inconclusive {
        InconclusivePolicy::Exclude
    } else {
        InconclusivePolicy::AsFail
    };

    let comparison = eval::compare(&results, &labels, policy);
    print!("{}", comparison.render());

    if let Some(out) = args.out {
        let json = serde_json::to_string_pretty(&comparison)?;
        std::fs::write(&out, json)
            .with_context(|| format!("failed to write comparison to {}", out.display()))?;
        println!("\nComparison saved to {}", out.display());
    }
    Ok(())
}

fn inspect_command(args: InspectArgs) -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let results = artifact::read_results(&args.results)?;
    println!("Loaded {} rows from {}", results.len(), args.results.display());
    print!("{}", eval::render_inspection(&results, args.limit));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_interrupt_requests_abort() {
        let (tx, rx) = watch::channel(false);
        let mut seen = 0;
        let abort = watch_interrupts(
            || {
                seen += 1;
                async { Ok(()) }
            },
            tx,
        )
        .await;
        assert!(abort);
        assert_eq!(seen, 2);
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn missing_signal_handler_never_aborts() {
        let (tx, rx) = watch::channel(false);
        let abort = watch_interrupts(|| async { Err(std::io::Error::other("no handler")) }, tx).await;
        assert!(!abort);
        assert!(!*rx.borrow());
    }
}
