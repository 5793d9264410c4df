use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use thiserror::Error;

use crate::services::extraction::{ExtractionMode, PipelineSettings};
use crate::services::llm::DEFAULT_BASE_URL;
use crate::services::orchestrator::OrchestratorSettings;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// API key for the completion service
    #[garde(length(min = 1))]
    pub openai_api_key: String,

    #[garde(length(min = 1))]
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,

    #[garde(length(min = 1))]
    #[serde(default = "default_model")]
    pub model: String,

    #[garde(range(min = 0.0, max = 2.0))]
    #[serde(default)]
    pub temperature: f32,

    #[garde(range(min = 1, max = 32768))]
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Resume text beyond this budget is dropped from the end.
    #[garde(range(min = 1000))]
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,

    #[garde(skip)]
    #[serde(default = "default_extraction_mode")]
    pub extraction_mode: ExtractionMode,

    #[garde(skip)]
    #[serde(default)]
    pub use_batch_api: bool,

    #[garde(range(min = 1, max = 1000))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[garde(range(min = 1, max = 64))]
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[garde(range(min = 1))]
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[garde(range(min = 1, max = 168))]
    #[serde(default = "default_completion_window_hours")]
    pub completion_window_hours: u32,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_max_open_jobs")]
    pub max_open_jobs: usize,

    /// Continuous mode stops after this many jobs finish. Unset runs until stopped.
    #[garde(range(min = 1))]
    pub target_jobs: Option<usize>,

    #[garde(range(min = 1, max = 20))]
    #[serde(default = "default_db_max_attempts")]
    pub db_max_attempts: u32,

    #[garde(range(min = 1))]
    #[serde(default = "default_db_base_delay_ms")]
    pub db_base_delay_ms: u64,

    #[garde(custom(at_least(self.db_base_delay_ms)))]
    #[serde(default = "default_db_max_delay_ms")]
    pub db_max_delay_ms: u64,

    /// Taxonomy table overriding the built-in one
    #[garde(skip)]
    pub taxonomy_path: Option<PathBuf>,

    /// Prometheus listener; metrics are not exported when unset
    #[garde(skip)]
    pub metrics_addr: Option<SocketAddr>,

    #[garde(skip)]
    #[serde(default)]
    pub log_format: LogFormat,
}

fn at_least(min: u64) -> impl FnOnce(&u64, &()) -> garde::Result {
    move |value, _| {
        if *value < min {
            return Err(garde::Error::new(format!(
                "must be at least the base delay ({min} ms)"
            )));
        }
        Ok(())
    }
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_max_input_tokens() -> usize {
    100_000
}

fn default_extraction_mode() -> ExtractionMode {
    ExtractionMode::TwoStep
}

fn default_batch_size() -> usize {
    50
}

fn default_workers() -> usize {
    8
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_completion_window_hours() -> u32 {
    24
}

fn default_max_open_jobs() -> usize {
    5
}

fn default_db_max_attempts() -> u32 {
    5
}

fn default_db_base_delay_ms() -> u64 {
    200
}

fn default_db_max_delay_ms() -> u64 {
    10_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Re-run validation, e.g. after command-line overrides.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn db_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.db_max_attempts,
            Duration::from_millis(self.db_base_delay_ms),
            Duration::from_millis(self.db_max_delay_ms),
        )
    }

    /// Retry policy for HTTP calls to the completion service.
    pub fn llm_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_secs(2), Duration::from_secs(60))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            max_input_tokens: self.max_input_tokens,
            mode: self.extraction_mode,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            batch_size: self.batch_size,
            completion_window_hours: self.completion_window_hours,
            poll_interval: self.poll_interval(),
            max_open_jobs: self.max_open_jobs,
            target_jobs: self.target_jobs,
            apply_workers: self.workers,
        }
    }
}
