use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct EvaluationMetrics {
    records: Counter<u64>,
    record_duration_ms: Histogram<f64>,
    retries: Counter<u64>,
    item_failures: Counter<u64>,
}

static METRICS: OnceCell<EvaluationMetrics> = OnceCell::new();

fn handles() -> &'static EvaluationMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("cove.evaluation");
        EvaluationMetrics {
            records: meter
                .u64_counter("cove_records_total")
                .with_description("Records evaluated, by completion status")
                .init(),
            record_duration_ms: meter
                .f64_histogram("cove_record_duration_ms")
                .with_description("Wall time spent evaluating one record")
                .init(),
            retries: meter
                .u64_counter("cove_reasoning_retries_total")
                .with_description("Reasoning calls retried after an overload signal")
                .init(),
            item_failures: meter
                .u64_counter("cove_item_failures_total")
                .with_description("Evidence items whose processing was recorded as an error")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("COVE_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "COVE_OTEL_METRICS_ENDPOINT detected for {service_name}. Install an OTLP meter provider in your deployment to export evaluation metrics."
        );
    }
}

/// Record one finished record (no-op without an installed provider).
pub fn record_completion(status: &str, duration_ms: u64, evidence_count: usize) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("status", status.to_string()),
        KeyValue::new("evidence_count", evidence_count as i64),
    ];
    metrics.records.add(1, &attrs);
    metrics.record_duration_ms.record(duration_ms as f64, &attrs);
}

pub fn record_retry(stage: &str) {
    handles()
        .retries
        .add(1, &[KeyValue::new("stage", stage.to_string())]);
}

pub fn record_item_failure(kind: &str) {
    handles()
        .item_failures
        .add(1, &[KeyValue::new("kind", kind.to_string())]);
}
