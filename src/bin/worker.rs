use std::sync::Arc;
use std::time::Duration;

use resume_extract::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries::PgResumeStore},
    services::{llm::OpenAiClient, taxonomy::Taxonomy},
    telemetry,
};
use tokio::sync::watch;
use tokio::time::sleep;

/// Pause before restarting the control loop after a recoverable failure.
const RESTART_DELAY_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("Failed to load configuration");

    telemetry::init_tracing(config.log_format, false);
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr).expect("Failed to install Prometheus metrics exporter");
    }

    tracing::info!("Starting resume extraction worker");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let taxonomy = match &config.taxonomy_path {
        Some(path) => Taxonomy::load(path),
        None => Taxonomy::builtin(),
    }
    .expect("Failed to load taxonomy");
    tracing::info!(terms = taxonomy.entries().len(), "Taxonomy loaded");

    let llm = OpenAiClient::new(
        config.openai_api_key.clone(),
        &config.openai_base_url,
        config.llm_retry_policy(),
    )
    .expect("Failed to initialize LLM client");

    let use_batch_api = config.use_batch_api;
    let state = AppState::new(
        config,
        Arc::new(PgResumeStore::new(db_pool)),
        Arc::new(llm),
        taxonomy,
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(batch_api = use_batch_api, "Worker ready, entering processing loop");

    // Recoverable failures restart the loop; open jobs resume from the store.
    while !*shutdown_rx.borrow() {
        let outcome = if use_batch_api {
            state
                .orchestrator()
                .run_continuous(shutdown_rx.clone())
                .await
                .map(|summary| summary.report)
                .map_err(|e| (e.is_run_terminal(), e.to_string()))
        } else {
            state
                .direct_processor()
                .run_continuous(
                    state.config.batch_size,
                    state.config.poll_interval(),
                    state.config.target_jobs,
                    shutdown_rx.clone(),
                )
                .await
                .map_err(|e| (false, e.to_string()))
        };

        match outcome {
            Ok(report) => {
                tracing::info!(
                    succeeded = report.succeeded.len(),
                    failed = report.failed.len(),
                    "Processing loop finished"
                );
                if report.has_terminal_failure() {
                    tracing::error!("Stopping worker after a run-terminal failure");
                    std::process::exit(1);
                }
                if state.config.target_jobs.is_some() {
                    break;
                }
            }
            Err((true, e)) => {
                tracing::error!(error = %e, "Run-terminal failure, stopping worker");
                std::process::exit(1);
            }
            Err((false, e)) => {
                tracing::error!(error = %e, "Processing loop failed, restarting");
                tokio::select! {
                    _ = sleep(Duration::from_secs(RESTART_DELAY_SECS)) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    tracing::info!("Worker stopped");
}
