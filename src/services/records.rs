use std::fmt;

use chrono::Utc;
use serde::Serialize;
use strum::Display;
use tracing::{info, warn};

use crate::db::retrying::Persistence;
use crate::db::StoreError;
use crate::models::field::RawFields;
use crate::models::resume::UserId;
use crate::services::validation::FieldValidator;

/// Where a record's path stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extract,
    Parse,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub user_id: Option<UserId>,
    pub stage: Stage,
    pub message: String,
    /// Continuing the run cannot succeed (credentials, quota).
    #[serde(skip)]
    pub terminal: bool,
}

impl RecordFailure {
    pub fn new(user_id: Option<UserId>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            user_id,
            stage,
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id {
            Some(id) => write!(f, "user {id} failed at {}: {}", self.stage, self.message),
            None => write!(f, "unattributed record failed at {}: {}", self.stage, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSuccess {
    pub user_id: UserId,
    pub populated: usize,
    pub violations: usize,
}

/// Per-run or per-job outcome of every attempted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub succeeded: Vec<RecordSuccess>,
    pub failed: Vec<RecordFailure>,
}

impl ApplyReport {
    pub fn record(&mut self, outcome: Result<RecordSuccess, RecordFailure>) {
        match outcome {
            Ok(success) => self.succeeded.push(success),
            Err(failure) => self.failed.push(failure),
        }
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn has_terminal_failure(&self) -> bool {
        self.failed.iter().any(|f| f.terminal)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} attempted, {} succeeded, {} failed",
            self.attempted(),
            self.succeeded.len(),
            self.failed.len()
        )?;
        for failure in &self.failed {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}

fn store_failure(user_id: UserId, e: StoreError) -> RecordFailure {
    let failure = RecordFailure::new(Some(user_id), Stage::Persist, e.to_string());
    match e {
        StoreError::Auth(_) | StoreError::Schema(_) => failure.terminal(),
        _ => failure,
    }
}

/// Validate raw fields and persist them with the processed marker, as one unit.
pub async fn commit_record(
    validator: &FieldValidator,
    persistence: &Persistence,
    user_id: UserId,
    raw: &RawFields,
) -> Result<RecordSuccess, RecordFailure> {
    let validated = validator.validate(user_id, raw);
    let populated = validated.result.populated();
    let violations = validated.violations.len();

    match persistence
        .apply_extraction(&validated.result, &validated.violations, Utc::now())
        .await
    {
        Ok(()) => {
            info!(user_id = %user_id, populated, violations, "Record processed");
            metrics::counter!("resumes_processed_total").increment(1);
            Ok(RecordSuccess {
                user_id,
                populated,
                violations,
            })
        }
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to persist record");
            metrics::counter!("resumes_failed_total", "stage" => "persist").increment(1);
            Err(store_failure(user_id, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_failures_with_context() {
        let mut report = ApplyReport::default();
        report.record(Ok(RecordSuccess {
            user_id: UserId(1),
            populated: 10,
            violations: 0,
        }));
        report.record(Err(RecordFailure::new(
            Some(UserId(2)),
            Stage::Parse,
            "model output is not valid JSON",
        )));
        report.record(Err(RecordFailure::new(None, Stage::Parse, "malformed output line")));

        assert_eq!(report.attempted(), 3);
        assert!(!report.has_terminal_failure());
        let text = report.to_string();
        assert!(text.starts_with("3 attempted, 1 succeeded, 2 failed"));
        assert!(text.contains("user 2 failed at parse"));
        assert!(text.contains("unattributed record failed at parse"));
    }

    #[test]
    fn test_auth_failures_are_terminal() {
        let failure = store_failure(UserId(3), StoreError::Auth("password rejected".into()));
        assert!(failure.terminal);
        let failure = store_failure(UserId(3), StoreError::NotFound(UserId(3)));
        assert!(!failure.terminal);
    }
}
