use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use resume_extract::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries::PgResumeStore},
    models::resume::UserId,
    services::{
        extraction::ExtractionMode,
        llm::OpenAiClient,
        orchestrator::{BatchError, JobProgress},
        records::ApplyReport,
        taxonomy::Taxonomy,
    },
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "resume-extract")]
#[command(about = "Extract structured candidate data from resumes")]
struct Cli {
    /// Records fetched per batch or batch job
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Parallel workers in direct mode and when applying batch results
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Submit work through the batch API instead of direct completions
    #[arg(long, global = true, overrides_with = "no_batch_api")]
    use_batch_api: bool,

    #[arg(long, global = true, overrides_with = "use_batch_api")]
    no_batch_api: bool,

    /// Extract every field in a single request
    #[arg(long, global = true)]
    unified: bool,

    /// Only log errors
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process one candidate directly, even if already processed
    User { user_id: i64 },
    /// Process one batch of unprocessed records, or submit one batch job
    Batch,
    /// Keep processing until stopped or the job target is reached
    Continuous {
        /// Seconds between polls, or between idle checks in direct mode
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many batches or batch jobs
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Poll one batch job and apply it if complete
    Check { job_id: String },
    /// Apply database migrations
    Migrate,
}

impl Cli {
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.use_batch_api {
            config.use_batch_api = true;
        }
        if self.no_batch_api {
            config.use_batch_api = false;
        }
        if self.unified {
            config.extraction_mode = ExtractionMode::OneStep;
        }
        if let Commands::Continuous { interval, jobs } = &self.command {
            if let Some(interval) = interval {
                config.poll_interval_secs = *interval;
            }
            if jobs.is_some() {
                config.target_jobs = *jobs;
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().expect("Failed to load configuration from environment");
    cli.apply_to(&mut config);
    config
        .ensure_valid()
        .expect("Invalid configuration after command-line overrides");

    telemetry::init_tracing(config.log_format, cli.quiet);
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr).expect("Failed to install Prometheus metrics exporter");
    }

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    if let Commands::Migrate = cli.command {
        db::run_migrations(&db_pool)
            .await
            .expect("Failed to run database migrations");
        println!("migrations applied");
        return ExitCode::SUCCESS;
    }

    let taxonomy = match &config.taxonomy_path {
        Some(path) => Taxonomy::load(path),
        None => Taxonomy::builtin(),
    }
    .expect("Failed to load taxonomy");

    let llm = OpenAiClient::new(
        config.openai_api_key.clone(),
        &config.openai_base_url,
        config.llm_retry_policy(),
    )
    .expect("Failed to initialize LLM client");

    let state = AppState::new(
        config,
        Arc::new(PgResumeStore::new(db_pool)),
        Arc::new(llm),
        taxonomy,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current step");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Commands::User { user_id } => {
            let processor = state.direct_processor();
            match processor.process_user(UserId(user_id)).await {
                Ok(success) => {
                    println!(
                        "user {} processed: {} fields populated, {} violations",
                        success.user_id, success.populated, success.violations
                    );
                    ExitCode::SUCCESS
                }
                Err(failure) => {
                    eprintln!("{failure}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Batch if state.config.use_batch_api => {
            let orchestrator = state.orchestrator();
            match orchestrator.submit_next(state.config.batch_size).await {
                Ok(Some(job)) => {
                    println!(
                        "submitted batch job {} with {} records",
                        job.job_id(),
                        job.meta().record_count
                    );
                    ExitCode::SUCCESS
                }
                Ok(None) => {
                    println!("no unprocessed records");
                    ExitCode::SUCCESS
                }
                Err(e) => batch_failed(e),
            }
        }
        Commands::Batch => {
            let processor = state.direct_processor();
            match processor.run_batch(state.config.batch_size).await {
                Ok(report) => finish(&report),
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Continuous { .. } if state.config.use_batch_api => {
            let orchestrator = state.orchestrator();
            match orchestrator.run_continuous(shutdown_rx).await {
                Ok(summary) => {
                    println!("{} batch jobs finished", summary.finished);
                    if !summary.still_open.is_empty() {
                        println!("still open: {}", summary.still_open.join(", "));
                    }
                    finish(&summary.report)
                }
                Err(e) => batch_failed(e),
            }
        }
        Commands::Continuous { .. } => {
            let processor = state.direct_processor();
            let result = processor
                .run_continuous(
                    state.config.batch_size,
                    state.config.poll_interval(),
                    state.config.target_jobs,
                    shutdown_rx,
                )
                .await;
            match result {
                Ok(report) => finish(&report),
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Check { job_id } => {
            let orchestrator = state.orchestrator();
            match orchestrator.check(&job_id).await {
                Ok(JobProgress { job, report }) => {
                    println!("batch job {} is {}", job.job_id(), job.status());
                    match report {
                        Some(report) => finish(&report),
                        None => ExitCode::SUCCESS,
                    }
                }
                Err(e) => batch_failed(e),
            }
        }
        Commands::Migrate => ExitCode::SUCCESS,
    }
}

fn finish(report: &ApplyReport) -> ExitCode {
    print!("{report}");
    if report.has_terminal_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn batch_failed(e: BatchError) -> ExitCode {
    tracing::error!(error = %e, "Batch operation failed");
    eprintln!("{e}");
    ExitCode::FAILURE
}
