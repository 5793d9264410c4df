use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::retrying::Persistence;
use crate::db::StoreError;
use crate::models::resume::{ResumeRecord, UserId};
use crate::services::extraction::{ExtractionError, ExtractionPipeline};
use crate::services::records::{commit_record, ApplyReport, RecordFailure, RecordSuccess, Stage};
use crate::services::validation::FieldValidator;

/// Synchronous-completion mode: a fixed pool of workers, each owning one
/// record from prompt to commit.
#[derive(Clone)]
pub struct DirectProcessor {
    pipeline: ExtractionPipeline,
    validator: FieldValidator,
    persistence: Persistence,
    workers: usize,
}

impl DirectProcessor {
    pub fn new(
        pipeline: ExtractionPipeline,
        validator: FieldValidator,
        persistence: Persistence,
        workers: usize,
    ) -> Self {
        Self {
            pipeline,
            validator,
            persistence,
            workers: workers.max(1),
        }
    }

    /// Extract, validate and persist one record.
    pub async fn process_record(&self, record: &ResumeRecord) -> Result<RecordSuccess, RecordFailure> {
        let user_id = record.user_id;
        if record.text.trim().is_empty() {
            return Err(RecordFailure::new(Some(user_id), Stage::Fetch, "resume text is empty"));
        }

        let raw = match self.pipeline.extract(record).await {
            Ok(raw) => raw,
            Err(e) => {
                let stage = match e {
                    ExtractionError::Llm(_) | ExtractionError::PromptTooLarge { .. } => Stage::Extract,
                    _ => Stage::Parse,
                };
                warn!(user_id = %user_id, stage = %stage, error = %e, "Extraction failed");
                metrics::counter!("resumes_failed_total", "stage" => stage.to_string()).increment(1);
                let failure = RecordFailure::new(Some(user_id), stage, e.to_string());
                return Err(if e.is_run_terminal() {
                    failure.terminal()
                } else {
                    failure
                });
            }
        };

        commit_record(&self.validator, &self.persistence, user_id, &raw).await
    }

    /// Process a single candidate by id, regardless of its processed marker.
    pub async fn process_user(&self, user_id: UserId) -> Result<RecordSuccess, RecordFailure> {
        let record = self
            .persistence
            .fetch_by_id(user_id)
            .await
            .map_err(|e| RecordFailure::new(Some(user_id), Stage::Fetch, e.to_string()))?;
        if record.is_processed() {
            info!(user_id = %user_id, "Reprocessing an already processed record");
        }
        self.process_record(&record).await
    }

    /// Fetch up to `batch_size` unprocessed records and run them through the pool.
    ///
    /// A run-terminal failure stops the pool; records not yet finished stay
    /// unprocessed.
    pub async fn run_batch(&self, batch_size: usize) -> Result<ApplyReport, StoreError> {
        self.run_batch_excluding(batch_size, &[]).await
    }

    /// [`run_batch`](Self::run_batch) without the records in `exclude`.
    pub async fn run_batch_excluding(
        &self,
        batch_size: usize,
        exclude: &[UserId],
    ) -> Result<ApplyReport, StoreError> {
        let records = self.persistence.fetch_unprocessed(batch_size, exclude).await?;
        info!(records = records.len(), workers = self.workers, "Starting direct batch");
        Ok(self.run_records(records).await)
    }

    pub async fn run_records(&self, records: Vec<ResumeRecord>) -> ApplyReport {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for record in records {
            let processor = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                processor.process_record(&record).await
            });
        }

        let mut report = ApplyReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    let terminal = outcome.as_ref().err().is_some_and(|f| f.terminal);
                    report.record(outcome);
                    if terminal {
                        error!("Run-terminal failure, stopping remaining workers");
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Direct batch finished"
        );
        report
    }

    /// Keep processing batches until the backlog is empty, `max_batches`
    /// is reached or shutdown is signalled. Waits `idle_wait` when idle.
    ///
    /// A record that fails is not fetched again for the rest of the run.
    pub async fn run_continuous(
        &self,
        batch_size: usize,
        idle_wait: Duration,
        max_batches: Option<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ApplyReport, StoreError> {
        let mut total = ApplyReport::default();
        let mut skipped: Vec<UserId> = Vec::new();
        let mut batches = 0;

        while !*shutdown.borrow() {
            if max_batches.is_some_and(|max| batches >= max) {
                break;
            }

            let report = self.run_batch_excluding(batch_size, &skipped).await?;
            let idle = report.attempted() == 0;
            let terminal = report.has_terminal_failure();
            skipped.extend(report.failed.iter().filter_map(|f| f.user_id));
            total.merge(report);
            if terminal {
                break;
            }
            if !idle {
                batches += 1;
                continue;
            }

            info!(
                wait_secs = idle_wait.as_secs(),
                skipped = skipped.len(),
                "No unprocessed records, waiting"
            );
            tokio::select! {
                _ = tokio::time::sleep(idle_wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(idle_wait).await;
                    }
                }
            }
        }

        Ok(total)
    }
}
