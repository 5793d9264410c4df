use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use thiserror::Error;

use crate::models::batch::{BatchJobRecord, JobRecordError};
use crate::models::field::{ExtractionResult, Field};
use crate::models::resume::{ResumeRecord, UserId};
use crate::services::retry::{Classify, FailureClass};
use crate::services::validation::FieldViolation;

pub mod queries;
pub mod retrying;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// SQLSTATE codes for lock conflicts that succeed when retried.
const RETRYABLE_STATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement/lock timeout)
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock conflict ({code}): {message}")]
    Deadlock { code: String, message: String },

    #[error("database connection error: {0}")]
    Connection(String),

    #[error("database authentication failed: {0}")]
    Auth(String),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("column {field} rejected value {value:?}: {message}")]
    FieldRejected {
        field: Field,
        value: String,
        message: String,
    },

    #[error("value rejected: {0}")]
    DataRejected(String),

    #[error("user {0} not found")]
    NotFound(UserId),

    #[error("corrupt batch job row: {0}")]
    CorruptJob(#[from] JobRecordError),

    #[error("database error: {0}")]
    Other(String),
}

impl Classify for StoreError {
    fn failure_class(&self) -> FailureClass {
        match self {
            StoreError::Deadlock { .. } | StoreError::Connection(_) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                let message = db.message().to_string();
                if RETRYABLE_STATES.contains(&code.as_str()) {
                    StoreError::Deadlock { code, message }
                } else if code.starts_with("28") {
                    StoreError::Auth(message)
                } else if code.starts_with("08") {
                    StoreError::Connection(message)
                } else if code.starts_with("42") {
                    StoreError::Schema(format!("{code}: {message}"))
                } else if code.starts_with("22") || code.starts_with("23") {
                    StoreError::DataRejected(format!("{code}: {message}"))
                } else {
                    StoreError::Other(format!("{code}: {message}"))
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(e.to_string()),
            sqlx::Error::Tls(_) => StoreError::Connection(e.to_string()),
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::TypeNotFound { .. } => StoreError::Schema(e.to_string()),
            _ => StoreError::Other(e.to_string()),
        }
    }
}

/// The relational store holding resumes, extracted fields and batch jobs.
///
/// Every statement is parameterized. Writes for one candidate happen in one
/// transaction.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Unprocessed resumes not already queued in an open batch job and not
    /// in `exclude`, newest first.
    async fn fetch_unprocessed(
        &self,
        limit: usize,
        exclude: &[UserId],
    ) -> Result<Vec<ResumeRecord>, StoreError>;

    async fn fetch_by_id(&self, user_id: UserId) -> Result<ResumeRecord, StoreError>;

    /// Write every field, record violations and set the processed marker.
    async fn apply_extraction(
        &self,
        result: &ExtractionResult,
        violations: &[FieldViolation],
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert or update a job row; `members` are recorded the first time.
    async fn upsert_batch_job(
        &self,
        record: &BatchJobRecord,
        members: &[UserId],
    ) -> Result<(), StoreError>;

    async fn load_batch_job(&self, job_id: &str) -> Result<Option<BatchJobRecord>, StoreError>;

    /// Jobs that are not yet applied, failed or expired, oldest first.
    async fn open_batch_jobs(&self) -> Result<Vec<BatchJobRecord>, StoreError>;

    async fn batch_members(&self, job_id: &str) -> Result<Vec<UserId>, StoreError>;
}
