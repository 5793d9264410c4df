use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{ResumeStore, StoreError};
use crate::models::batch::BatchJobRecord;
use crate::models::field::ExtractionResult;
use crate::models::resume::{ResumeRecord, UserId};
use crate::services::retry::RetryPolicy;
use crate::services::validation::FieldViolation;

/// A [`ResumeStore`] wrapped in bounded retry for lock conflicts and
/// connection blips. Fatal errors surface on the first attempt.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn ResumeStore>,
    policy: RetryPolicy,
}

impl Persistence {
    pub fn new(store: Arc<dyn ResumeStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy: policy.with_counter("db_retries_total"),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResumeStore> {
        &self.store
    }

    pub async fn fetch_unprocessed(
        &self,
        limit: usize,
        exclude: &[UserId],
    ) -> Result<Vec<ResumeRecord>, StoreError> {
        self.policy
            .run("fetch_unprocessed", || self.store.fetch_unprocessed(limit, exclude))
            .await
    }

    pub async fn fetch_by_id(&self, user_id: UserId) -> Result<ResumeRecord, StoreError> {
        self.policy
            .run("fetch_by_id", || self.store.fetch_by_id(user_id))
            .await
    }

    /// Each attempt is its own transaction, so a retried write lands once.
    pub async fn apply_extraction(
        &self,
        result: &ExtractionResult,
        violations: &[FieldViolation],
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.policy
            .run("apply_extraction", || {
                self.store.apply_extraction(result, violations, processed_at)
            })
            .await
    }

    pub async fn upsert_batch_job(
        &self,
        record: &BatchJobRecord,
        members: &[UserId],
    ) -> Result<(), StoreError> {
        self.policy
            .run("upsert_batch_job", || self.store.upsert_batch_job(record, members))
            .await
    }

    pub async fn load_batch_job(&self, job_id: &str) -> Result<Option<BatchJobRecord>, StoreError> {
        self.policy
            .run("load_batch_job", || self.store.load_batch_job(job_id))
            .await
    }

    pub async fn open_batch_jobs(&self) -> Result<Vec<BatchJobRecord>, StoreError> {
        self.policy
            .run("open_batch_jobs", || self.store.open_batch_jobs())
            .await
    }

    pub async fn batch_members(&self, job_id: &str) -> Result<Vec<UserId>, StoreError> {
        self.policy
            .run("batch_members", || self.store.batch_members(job_id))
            .await
    }
}
