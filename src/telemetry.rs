use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Initialize structured logging. `RUST_LOG` wins over the default level;
/// `quiet` lowers the default to errors only.
pub fn init_tracing(format: LogFormat, quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

/// Install the Prometheus recorder with an HTTP listener on `addr` and
/// register the application metrics.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    metrics::describe_counter!(
        "resumes_processed_total",
        "Resumes whose extracted fields were persisted"
    );
    metrics::describe_counter!(
        "resumes_failed_total",
        "Resumes that failed at some stage, labelled by stage"
    );
    metrics::describe_counter!(
        "resumes_truncated_total",
        "Resumes cut to fit the input token budget"
    );
    metrics::describe_counter!(
        "field_violations_total",
        "Extracted values nulled or rewritten by validation, labelled by field"
    );
    metrics::describe_counter!("batch_jobs_submitted_total", "Batch jobs submitted");
    metrics::describe_counter!(
        "batch_jobs_finished_total",
        "Batch jobs that reached a terminal state, labelled by status"
    );
    metrics::describe_counter!("db_retries_total", "Database operations retried");
    metrics::describe_counter!("llm_retries_total", "Completion service calls retried");
    metrics::describe_histogram!(
        "extraction_duration_seconds",
        "Time to extract one resume in direct mode"
    );

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}
