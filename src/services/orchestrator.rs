use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::retrying::Persistence;
use crate::db::StoreError;
use crate::models::batch::{BatchJob, CompletedJob, CreatedJob, JobRecordError};
use crate::models::resume::UserId;
use crate::services::extraction::{parse_output_line, ExtractionPipeline, LineOutcome};
use crate::services::llm::{LlmError, LlmService, RemoteBatchStatus};
use crate::services::records::{commit_record, ApplyReport, RecordFailure, Stage};
use crate::services::retry::{Classify, FailureClass};
use crate::services::validation::FieldValidator;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("batch job {0} not found")]
    JobNotFound(String),

    #[error(transparent)]
    Corrupt(#[from] JobRecordError),

    #[error("failed to encode batch input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("applying job {job_id} stopped: {reason}")]
    ApplyAborted { job_id: String, reason: String },
}

impl BatchError {
    /// Continuing the run cannot succeed.
    pub fn is_run_terminal(&self) -> bool {
        match self {
            BatchError::Llm(e) => e.is_run_terminal(),
            BatchError::Store(e) => matches!(e, StoreError::Auth(_) | StoreError::Schema(_)),
            BatchError::ApplyAborted { .. } => true,
            _ => false,
        }
    }
}

impl Classify for BatchError {
    fn failure_class(&self) -> FailureClass {
        match self {
            BatchError::Llm(e) => e.failure_class(),
            BatchError::Store(e) => e.failure_class(),
            _ => FailureClass::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    pub completion_window_hours: u32,
    pub poll_interval: Duration,
    pub max_open_jobs: usize,
    /// Stop once this many jobs reached a terminal state. `None` runs until shutdown.
    pub target_jobs: Option<usize>,
    pub apply_workers: usize,
}

/// Where a job ended up after one step, plus the report if it was applied.
#[derive(Debug)]
pub struct JobProgress {
    pub job: BatchJob,
    pub report: Option<ApplyReport>,
}

#[derive(Debug, Default)]
pub struct ContinuousSummary {
    pub finished: usize,
    pub still_open: Vec<String>,
    pub report: ApplyReport,
}

/// Drives batch jobs through submit, poll and apply. The store is the
/// source of truth; every state change is persisted before moving on.
#[derive(Clone)]
pub struct BatchOrchestrator {
    llm: Arc<dyn LlmService>,
    pipeline: ExtractionPipeline,
    validator: FieldValidator,
    persistence: Persistence,
    settings: OrchestratorSettings,
}

impl BatchOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmService>,
        pipeline: ExtractionPipeline,
        validator: FieldValidator,
        persistence: Persistence,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            llm,
            pipeline,
            validator,
            persistence,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn persist(&self, job: &BatchJob, members: &[UserId]) -> Result<(), BatchError> {
        self.persistence
            .upsert_batch_job(&job.to_record(), members)
            .await?;
        if job.is_terminal() {
            metrics::counter!("batch_jobs_finished_total", "status" => job.status().to_string())
                .increment(1);
        }
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Queue up to `limit` unprocessed resumes as one job.
    /// Returns `None` when there is nothing to submit.
    pub async fn submit_next(&self, limit: usize) -> Result<Option<BatchJob>, BatchError> {
        self.submit_excluding(limit, &mut Vec::new()).await
    }

    /// [`submit_next`](Self::submit_next) without the records in `exclude`.
    /// Records whose request cannot be built are added to `exclude`.
    pub async fn submit_excluding(
        &self,
        limit: usize,
        exclude: &mut Vec<UserId>,
    ) -> Result<Option<BatchJob>, BatchError> {
        let records = self.persistence.fetch_unprocessed(limit, exclude.as_slice()).await?;
        if records.is_empty() {
            debug!("No unprocessed records to submit");
            return Ok(None);
        }

        let mut jsonl = Vec::new();
        let mut members = Vec::with_capacity(records.len());
        for record in &records {
            match self.pipeline.batch_line(record) {
                Ok(line) => {
                    serde_json::to_writer(&mut jsonl, &line)?;
                    jsonl.push(b'\n');
                    members.push(record.user_id);
                }
                Err(e) => {
                    warn!(user_id = %record.user_id, error = %e, "Record left out of the batch");
                    metrics::counter!("resumes_failed_total", "stage" => Stage::Extract.to_string())
                        .increment(1);
                    exclude.push(record.user_id);
                }
            }
        }
        if members.is_empty() {
            return Ok(None);
        }

        let filename = format!("resume-batch-{}.jsonl", Utc::now().format("%Y%m%dT%H%M%S"));
        let input_file_id = self.llm.upload_batch_file(&filename, jsonl).await?;
        let created = CreatedJob::new(input_file_id, members);

        let hours = self.settings.completion_window_hours;
        let remote = self
            .llm
            .create_batch(&created.input_file_id, &format!("{hours}h"))
            .await?;

        let members = created.members.clone();
        let job = BatchJob::Submitted(created.submit(
            remote.id,
            Utc::now(),
            chrono::Duration::hours(i64::from(hours)),
        ));

        if let Err(e) = self.persist(&job, &members).await {
            error!(job_id = %job.job_id(), error = %e, "Submitted job could not be recorded");
            return Err(e);
        }

        metrics::counter!("batch_jobs_submitted_total").increment(1);
        info!(
            job_id = %job.job_id(),
            records = members.len(),
            deadline = %job.meta().deadline,
            "Batch job submitted"
        );
        Ok(Some(job))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Move `job` forward by one poll, applying its results if it completed.
    /// Terminal jobs are returned untouched.
    pub async fn advance(&self, job: BatchJob) -> Result<JobProgress, BatchError> {
        let next = match job {
            BatchJob::Applied(_) | BatchJob::Failed(_) | BatchJob::Expired(_) => {
                debug!(job_id = %job.job_id(), status = %job.status(), "Job already finished");
                return Ok(JobProgress { job, report: None });
            }
            BatchJob::Completed(completed) => return self.apply(completed).await,
            BatchJob::Submitted(submitted) => {
                let remote = self.llm.retrieve_batch(&submitted.meta.job_id).await?;
                match remote.status {
                    RemoteBatchStatus::Failed | RemoteBatchStatus::Cancelled => {
                        BatchJob::Failed(submitted.fail(remote.failure_reason()))
                    }
                    _ => submitted.begin_polling().observe(&remote, Utc::now()).into(),
                }
            }
            BatchJob::Polling(polling) => {
                let remote = self.llm.retrieve_batch(&polling.meta.job_id).await?;
                polling.observe(&remote, Utc::now()).into()
            }
        };

        self.persist(&next, &[]).await?;
        match &next {
            BatchJob::Failed(failed) => {
                warn!(job_id = %failed.meta.job_id, reason = %failed.reason, "Batch job failed")
            }
            BatchJob::Expired(expired) => {
                warn!(job_id = %expired.meta.job_id, "Batch job expired before completing")
            }
            other => info!(job_id = %other.job_id(), status = %other.status(), "Batch job checked"),
        }

        match next {
            BatchJob::Completed(completed) => self.apply(completed).await,
            job => Ok(JobProgress { job, report: None }),
        }
    }

    /// Load a job by id and advance it one step.
    pub async fn check(&self, job_id: &str) -> Result<JobProgress, BatchError> {
        let record = self
            .persistence
            .load_batch_job(job_id)
            .await?
            .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))?;
        self.advance(BatchJob::from_record(record)?).await
    }

    /// Parse, validate and persist every record of a completed job, then
    /// retire it. Record failures land in the report and never block the
    /// transition.
    pub async fn apply(&self, completed: CompletedJob) -> Result<JobProgress, BatchError> {
        let job_id = completed.meta.job_id.clone();
        let members = self.persistence.batch_members(&job_id).await?;
        let member_set: HashSet<UserId> = members.iter().copied().collect();

        let mut outcomes: Vec<(LineOutcome, Stage)> = Vec::new();
        if let Some(file_id) = &completed.output_file_id {
            let content = self.llm.file_content(file_id).await?;
            outcomes.extend(non_empty_lines(&content).map(|l| (parse_output_line(l), Stage::Parse)));
        }
        if let Some(file_id) = &completed.error_file_id {
            let content = self.llm.file_content(file_id).await?;
            outcomes.extend(non_empty_lines(&content).map(|l| (parse_output_line(l), Stage::Extract)));
        }

        let mut report = ApplyReport::default();
        let mut seen = HashSet::new();
        let permits = Arc::new(Semaphore::new(self.settings.apply_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (outcome, stage) in outcomes {
            let user_id = match &outcome {
                LineOutcome::Parsed { user_id, .. } => Some(*user_id),
                LineOutcome::Failed { user_id, .. } => *user_id,
            };
            if let Some(id) = user_id.filter(|id| !member_set.contains(id)) {
                warn!(job_id = %job_id, user_id = %id, "Line for a record outside this job ignored");
                continue;
            }

            match outcome {
                LineOutcome::Parsed { user_id, fields } => {
                    if !seen.insert(user_id) {
                        warn!(job_id = %job_id, user_id = %user_id, "Duplicate output line ignored");
                        continue;
                    }

                    let validator = self.validator.clone();
                    let persistence = self.persistence.clone();
                    let permits = Arc::clone(&permits);
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await;
                        commit_record(&validator, &persistence, user_id, &fields).await
                    });
                }
                // Its member is reported below as having no output line.
                LineOutcome::Failed { user_id: None, reason } => {
                    warn!(job_id = %job_id, reason = %reason, "Unattributable batch line");
                }
                LineOutcome::Failed {
                    user_id: Some(user_id),
                    reason,
                } => {
                    if !seen.insert(user_id) {
                        continue;
                    }
                    warn!(job_id = %job_id, user_id = %user_id, reason = %reason, "Batch record failed");
                    metrics::counter!("resumes_failed_total", "stage" => stage.to_string()).increment(1);
                    report.record(Err(RecordFailure::new(Some(user_id), stage, reason)));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    let terminal = outcome.as_ref().err().is_some_and(|f| f.terminal);
                    report.record(outcome);
                    if terminal {
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(job_id = %job_id, error = %e, "Apply task panicked"),
            }
        }

        if let Some(failure) = report.failed.iter().find(|f| f.terminal) {
            return Err(BatchError::ApplyAborted {
                job_id,
                reason: failure.to_string(),
            });
        }

        for user_id in members.iter().filter(|id| !seen.contains(id)) {
            metrics::counter!("resumes_failed_total", "stage" => Stage::Extract.to_string()).increment(1);
            report.record(Err(RecordFailure::new(
                Some(*user_id),
                Stage::Extract,
                "no output line for this record",
            )));
        }

        let applied = BatchJob::Applied(completed.applied(report.succeeded.len(), report.failed.len()));
        self.persist(&applied, &[]).await?;
        info!(
            job_id = %job_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Batch job applied"
        );

        Ok(JobProgress {
            job: applied,
            report: Some(report),
        })
    }

    // ── Continuous mode ──────────────────────────────────────────────

    async fn resume_open_jobs(&self) -> Result<Vec<BatchJob>, BatchError> {
        let mut jobs = Vec::new();
        for record in self.persistence.open_batch_jobs().await? {
            let job_id = record.job_id.clone();
            match BatchJob::from_record(record) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %job_id, error = %e, "Skipping unreadable batch job"),
            }
        }
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), "Resuming open batch jobs");
        }
        Ok(jobs)
    }

    /// Poll open jobs every interval, apply completed ones and submit new
    /// jobs while capacity allows. Stops on shutdown, on a run-terminal
    /// error or once `target_jobs` jobs have finished.
    ///
    /// Records that failed in an applied job are not resubmitted during the
    /// same run.
    pub async fn run_continuous(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ContinuousSummary, BatchError> {
        let mut open = self.resume_open_jobs().await?;
        let mut summary = ContinuousSummary::default();
        let mut skipped: Vec<UserId> = Vec::new();

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        ticker.tick().await;
                    }
                }
            }
            if *shutdown.borrow() {
                info!(open = open.len(), "Shutdown requested, open jobs stay resumable");
                break;
            }

            let mut still_open = Vec::with_capacity(open.len());
            for job in open.drain(..) {
                match self.advance(job.clone()).await {
                    Ok(progress) => {
                        if let Some(report) = progress.report {
                            skipped.extend(report.failed.iter().filter_map(|f| f.user_id));
                            summary.report.merge(report);
                        }
                        if progress.job.is_terminal() {
                            summary.finished += 1;
                        } else {
                            still_open.push(progress.job);
                        }
                    }
                    Err(e) if e.is_run_terminal() => return Err(e),
                    Err(e) => {
                        warn!(job_id = %job.job_id(), error = %e, "Job check failed, retrying next interval");
                        still_open.push(job);
                    }
                }
            }
            open = still_open;

            let target = self.settings.target_jobs;
            if target.is_some_and(|t| summary.finished >= t) {
                info!(finished = summary.finished, "Target job count reached");
                break;
            }

            let wanted = target.map_or(true, |t| summary.finished + open.len() < t);
            if wanted && open.len() < self.settings.max_open_jobs {
                match self.submit_excluding(self.settings.batch_size, &mut skipped).await {
                    Ok(Some(job)) => open.push(job),
                    Ok(None) if open.is_empty() => debug!("Idle, nothing to submit"),
                    Ok(None) => {}
                    Err(e) if e.is_run_terminal() => return Err(e),
                    Err(e) => warn!(error = %e, "Submission failed, retrying next interval"),
                }
            }
        }

        summary.still_open = open.iter().map(|j| j.job_id().to_string()).collect();
        Ok(summary)
    }
}

fn non_empty_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().filter(|line| !line.trim().is_empty())
}
