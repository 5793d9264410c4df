use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::models::resume::UserId;
use crate::services::llm::{RemoteBatch, RemoteBatchStatus};

/// Persisted status label of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Created,
    Submitted,
    Polling,
    Completed,
    Applied,
    Failed,
    Expired,
}

impl BatchStatus {
    /// Terminal jobs are never polled again and release their members.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Applied | BatchStatus::Failed | BatchStatus::Expired)
    }
}

/// Flat row form of a batch job as stored in `batch_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobRecord {
    pub job_id: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub status: BatchStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub record_count: i32,
    pub deadline: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub succeeded: Option<i32>,
    pub failed: Option<i32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum JobRecordError {
    #[error("batch job {job_id} is {status} but has no {missing}")]
    Missing {
        job_id: String,
        status: BatchStatus,
        missing: &'static str,
    },

    #[error("batch job {0} is stored as created, which is never persisted")]
    Unpersisted(String),
}

/// Identity shared by every persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMeta {
    pub job_id: String,
    pub input_file_id: String,
    pub submitted_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub record_count: i32,
    pub deadline: DateTime<Utc>,
}

// ── States ───────────────────────────────────────────────────────────
//
// Each state owns its data and only exposes the transitions that are legal
// from it. Transitions consume `self`, so a stale handle cannot be advanced
// twice.

/// Input artifact built and uploaded, not yet accepted as a job.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedJob {
    pub input_file_id: String,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub meta: JobMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingJob {
    pub meta: JobMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub meta: JobMeta,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
}

/// Retired job. There are no transitions out of this state.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedJob {
    pub meta: JobMeta,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub succeeded: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub meta: JobMeta,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredJob {
    pub meta: JobMeta,
}

impl CreatedJob {
    pub fn new(input_file_id: impl Into<String>, members: Vec<UserId>) -> Self {
        Self {
            input_file_id: input_file_id.into(),
            members,
        }
    }

    /// The service accepted the job; `window` bounds how long it may run.
    pub fn submit(
        self,
        job_id: impl Into<String>,
        submitted_at: DateTime<Utc>,
        window: Duration,
    ) -> SubmittedJob {
        SubmittedJob {
            meta: JobMeta {
                job_id: job_id.into(),
                input_file_id: self.input_file_id,
                submitted_at,
                last_checked_at: None,
                record_count: self.members.len() as i32,
                deadline: submitted_at + window,
            },
        }
    }
}

impl SubmittedJob {
    pub fn begin_polling(self) -> PollingJob {
        PollingJob { meta: self.meta }
    }

    pub fn fail(self, reason: impl Into<String>) -> FailedJob {
        FailedJob {
            meta: self.meta,
            reason: reason.into(),
        }
    }
}

/// Result of one poll of an in-flight job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending(PollingJob),
    Completed(CompletedJob),
    Failed(FailedJob),
    Expired(ExpiredJob),
}

impl PollingJob {
    /// Folds the service's view of the job into the next local state.
    pub fn observe(mut self, remote: &RemoteBatch, now: DateTime<Utc>) -> PollOutcome {
        self.meta.last_checked_at = Some(now);

        match remote.status {
            RemoteBatchStatus::Completed => PollOutcome::Completed(CompletedJob {
                meta: self.meta,
                output_file_id: remote.output_file_id.clone(),
                error_file_id: remote.error_file_id.clone(),
            }),
            RemoteBatchStatus::Failed | RemoteBatchStatus::Cancelled => {
                PollOutcome::Failed(FailedJob {
                    meta: self.meta,
                    reason: remote.failure_reason(),
                })
            }
            RemoteBatchStatus::Expired => PollOutcome::Expired(ExpiredJob { meta: self.meta }),
            _ if now > self.meta.deadline => PollOutcome::Expired(ExpiredJob { meta: self.meta }),
            _ => PollOutcome::Pending(self),
        }
    }
}

impl CompletedJob {
    pub fn applied(self, succeeded: usize, failed: usize) -> AppliedJob {
        AppliedJob {
            meta: self.meta,
            output_file_id: self.output_file_id,
            error_file_id: self.error_file_id,
            succeeded: succeeded as i32,
            failed: failed as i32,
        }
    }
}

/// A persisted batch job in exactly one lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchJob {
    Submitted(SubmittedJob),
    Polling(PollingJob),
    Completed(CompletedJob),
    Applied(AppliedJob),
    Failed(FailedJob),
    Expired(ExpiredJob),
}

impl From<PollOutcome> for BatchJob {
    fn from(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Pending(job) => BatchJob::Polling(job),
            PollOutcome::Completed(job) => BatchJob::Completed(job),
            PollOutcome::Failed(job) => BatchJob::Failed(job),
            PollOutcome::Expired(job) => BatchJob::Expired(job),
        }
    }
}

impl BatchJob {
    pub fn meta(&self) -> &JobMeta {
        match self {
            BatchJob::Submitted(j) => &j.meta,
            BatchJob::Polling(j) => &j.meta,
            BatchJob::Completed(j) => &j.meta,
            BatchJob::Applied(j) => &j.meta,
            BatchJob::Failed(j) => &j.meta,
            BatchJob::Expired(j) => &j.meta,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.meta().job_id
    }

    pub fn status(&self) -> BatchStatus {
        match self {
            BatchJob::Submitted(_) => BatchStatus::Submitted,
            BatchJob::Polling(_) => BatchStatus::Polling,
            BatchJob::Completed(_) => BatchStatus::Completed,
            BatchJob::Applied(_) => BatchStatus::Applied,
            BatchJob::Failed(_) => BatchStatus::Failed,
            BatchJob::Expired(_) => BatchStatus::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn to_record(&self) -> BatchJobRecord {
        let meta = self.meta();
        let mut record = BatchJobRecord {
            job_id: meta.job_id.clone(),
            input_file_id: meta.input_file_id.clone(),
            output_file_id: None,
            error_file_id: None,
            status: self.status(),
            submitted_at: meta.submitted_at,
            last_checked_at: meta.last_checked_at,
            record_count: meta.record_count,
            deadline: meta.deadline,
            failure_reason: None,
            succeeded: None,
            failed: None,
        };

        match self {
            BatchJob::Completed(j) => {
                record.output_file_id = j.output_file_id.clone();
                record.error_file_id = j.error_file_id.clone();
            }
            BatchJob::Applied(j) => {
                record.output_file_id = j.output_file_id.clone();
                record.error_file_id = j.error_file_id.clone();
                record.succeeded = Some(j.succeeded);
                record.failed = Some(j.failed);
            }
            BatchJob::Failed(j) => record.failure_reason = Some(j.reason.clone()),
            BatchJob::Expired(_) => {
                record.failure_reason = Some("completion window elapsed".to_string())
            }
            BatchJob::Submitted(_) | BatchJob::Polling(_) => {}
        }

        record
    }

    pub fn from_record(record: BatchJobRecord) -> Result<Self, JobRecordError> {
        let meta = JobMeta {
            job_id: record.job_id.clone(),
            input_file_id: record.input_file_id,
            submitted_at: record.submitted_at,
            last_checked_at: record.last_checked_at,
            record_count: record.record_count,
            deadline: record.deadline,
        };

        Ok(match record.status {
            BatchStatus::Created => return Err(JobRecordError::Unpersisted(record.job_id)),
            BatchStatus::Submitted => BatchJob::Submitted(SubmittedJob { meta }),
            BatchStatus::Polling => BatchJob::Polling(PollingJob { meta }),
            BatchStatus::Completed => BatchJob::Completed(CompletedJob {
                meta,
                output_file_id: record.output_file_id,
                error_file_id: record.error_file_id,
            }),
            BatchStatus::Applied => BatchJob::Applied(AppliedJob {
                meta,
                output_file_id: record.output_file_id,
                error_file_id: record.error_file_id,
                succeeded: record.succeeded.unwrap_or(0),
                failed: record.failed.unwrap_or(0),
            }),
            BatchStatus::Failed => BatchJob::Failed(FailedJob {
                meta,
                reason: record.failure_reason.ok_or(JobRecordError::Missing {
                    job_id: record.job_id,
                    status: BatchStatus::Failed,
                    missing: "failure reason",
                })?,
            }),
            BatchStatus::Expired => BatchJob::Expired(ExpiredJob { meta }),
        })
    }
}
