use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct SchedulerMetrics {
    units: Counter<u64>,
    duration_ms: Histogram<f64>,
    retries: Counter<u64>,
}

static METRICS: OnceCell<SchedulerMetrics> = OnceCell::new();

fn handles() -> &'static SchedulerMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("delve.scheduler");
        SchedulerMetrics {
            units: meter
                .u64_counter("work_units_total")
                .with_description("Scheduled work units by kind and final status")
                .init(),
            duration_ms: meter
                .f64_histogram("work_unit_duration_ms")
                .with_description("Wall time of a work unit including retries, in milliseconds")
                .init(),
            retries: meter
                .u64_counter("work_unit_retries_total")
                .with_description("Retries scheduled after a retryable failure")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("DELVE_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DELVE_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export scheduler metrics."
        );
    }
    Ok(())
}

/// Record the outcome of one work unit (no-op if no provider installed).
pub fn record_work_unit(kind: &str, status: &str, duration_ms: u64, attempts: u32) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("kind", kind.to_string()),
        KeyValue::new("status", status.to_string()),
        KeyValue::new("attempts", i64::from(attempts)),
    ];

    metrics.units.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);
}

pub fn record_retry(kind: &str) {
    handles()
        .retries
        .add(1, &[KeyValue::new("kind", kind.to_string())]);
}
