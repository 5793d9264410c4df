//! In-memory collaborators for pipeline and batch tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use resume_extract::db::retrying::Persistence;
use resume_extract::db::{ResumeStore, StoreError};
use resume_extract::models::batch::{BatchJobRecord, BatchStatus};
use resume_extract::models::field::{ExtractionResult, Field};
use resume_extract::models::resume::{ResumeRecord, UserId};
use resume_extract::services::extraction::{ExtractionMode, ExtractionPipeline, PipelineSettings};
use resume_extract::services::llm::{
    ChatRequest, LlmError, LlmService, RemoteBatch, RemoteBatchStatus,
};
use resume_extract::services::retry::RetryPolicy;
use resume_extract::services::taxonomy::Taxonomy;
use resume_extract::services::validation::{FieldValidator, FieldViolation, ProcessingDate};

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredResume {
    pub text: String,
    pub last_processed: Option<DateTime<Utc>>,
    pub fields: Option<ExtractionResult>,
    pub flags: Vec<(Field, String)>,
}

#[derive(Default)]
struct StoreState {
    resumes: BTreeMap<UserId, StoredResume>,
    jobs: BTreeMap<String, BatchJobRecord>,
    members: BTreeMap<String, Vec<UserId>>,
    rejected: HashSet<UserId>,
}

/// [`ResumeStore`] over maps, with the same applied-job guard and queued
/// exclusion as the SQL implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    deadlocks_remaining: AtomicU32,
    apply_attempts: AtomicUsize,
    applied: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_resume(&self, user_id: i64, text: &str) {
        self.state.lock().unwrap().resumes.insert(
            UserId(user_id),
            StoredResume {
                text: text.to_string(),
                last_processed: None,
                fields: None,
                flags: Vec::new(),
            },
        );
    }

    /// The next `n` writes of extracted fields fail with a deadlock.
    pub fn inject_deadlocks(&self, n: u32) {
        self.deadlocks_remaining.store(n, Ordering::SeqCst);
    }

    /// Writes for `user_id` fail with a non-retryable data error.
    pub fn reject_writes_for(&self, user_id: i64) {
        self.state.lock().unwrap().rejected.insert(UserId(user_id));
    }

    pub fn resume(&self, user_id: i64) -> Option<StoredResume> {
        self.state.lock().unwrap().resumes.get(&UserId(user_id)).cloned()
    }

    pub fn job(&self, job_id: &str) -> Option<BatchJobRecord> {
        self.state.lock().unwrap().jobs.get(job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<BatchJobRecord> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn members(&self, job_id: &str) -> Vec<UserId> {
        self.state
            .lock()
            .unwrap()
            .members
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn apply_attempts(&self) -> usize {
        self.apply_attempts.load(Ordering::SeqCst)
    }

    /// Writes that took effect.
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    pub fn processed_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .resumes
            .iter()
            .filter(|(_, r)| r.last_processed.is_some())
            .map(|(id, _)| id.0)
            .collect()
    }
}

fn is_open(status: BatchStatus) -> bool {
    matches!(
        status,
        BatchStatus::Submitted | BatchStatus::Polling | BatchStatus::Completed
    )
}

#[async_trait]
impl ResumeStore for MemoryStore {
    async fn fetch_unprocessed(
        &self,
        limit: usize,
        exclude: &[UserId],
    ) -> Result<Vec<ResumeRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let queued: HashSet<UserId> = state
            .jobs
            .values()
            .filter(|job| is_open(job.status))
            .flat_map(|job| state.members.get(&job.job_id).into_iter().flatten().copied())
            .collect();

        Ok(state
            .resumes
            .iter()
            .rev()
            .filter(|(id, r)| {
                r.last_processed.is_none()
                    && !r.text.is_empty()
                    && !queued.contains(*id)
                    && !exclude.contains(*id)
            })
            .take(limit)
            .map(|(id, r)| ResumeRecord {
                user_id: *id,
                text: r.text.clone(),
                last_processed: None,
            })
            .collect())
    }

    async fn fetch_by_id(&self, user_id: UserId) -> Result<ResumeRecord, StoreError> {
        let state = self.state.lock().unwrap();
        let resume = state
            .resumes
            .get(&user_id)
            .ok_or(StoreError::NotFound(user_id))?;
        Ok(ResumeRecord {
            user_id,
            text: resume.text.clone(),
            last_processed: resume.last_processed,
        })
    }

    async fn apply_extraction(
        &self,
        result: &ExtractionResult,
        violations: &[FieldViolation],
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.apply_attempts.fetch_add(1, Ordering::SeqCst);
        let deadlocked = self
            .deadlocks_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if deadlocked {
            return Err(StoreError::Deadlock {
                code: "40P01".to_string(),
                message: "deadlock detected".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&result.user_id()) {
            return Err(StoreError::DataRejected(
                "22001: value too long for type character varying(50)".to_string(),
            ));
        }
        let resume = state
            .resumes
            .get_mut(&result.user_id())
            .ok_or(StoreError::NotFound(result.user_id()))?;
        resume.fields = Some(result.clone());
        resume.flags = violations
            .iter()
            .map(|v| (v.field, v.reason.to_string()))
            .collect();
        resume.last_processed = Some(processed_at);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_batch_job(
        &self,
        record: &BatchJobRecord,
        members: &[UserId],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let retired = state
            .jobs
            .get(&record.job_id)
            .is_some_and(|job| job.status == BatchStatus::Applied);
        if !retired {
            state.jobs.insert(record.job_id.clone(), record.clone());
        }
        let recorded = state.members.entry(record.job_id.clone()).or_default();
        for user_id in members {
            if !recorded.contains(user_id) {
                recorded.push(*user_id);
            }
        }
        Ok(())
    }

    async fn load_batch_job(&self, job_id: &str) -> Result<Option<BatchJobRecord>, StoreError> {
        Ok(self.job(job_id))
    }

    async fn open_batch_jobs(&self) -> Result<Vec<BatchJobRecord>, StoreError> {
        let mut open: Vec<_> = self
            .jobs()
            .into_iter()
            .filter(|job| is_open(job.status))
            .collect();
        open.sort_by_key(|job| job.submitted_at);
        Ok(open)
    }

    async fn batch_members(&self, job_id: &str) -> Result<Vec<UserId>, StoreError> {
        let mut members = self.members(job_id);
        members.sort();
        Ok(members)
    }
}

// ── LLM ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct LlmState {
    completions: VecDeque<Result<String, LlmError>>,
    fallback: Option<String>,
    requests: Vec<ChatRequest>,
    files: HashMap<String, String>,
    batches: HashMap<String, VecDeque<RemoteBatch>>,
    created: Vec<(String, String)>,
    next_id: usize,
}

/// [`LlmService`] that replays scripted completions and batch states.
#[derive(Default)]
pub struct ScriptedLlm {
    state: Mutex<LlmState>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .completions
            .push_back(Ok(text.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.state.lock().unwrap().completions.push_back(Err(error));
    }

    /// Reply used once the scripted completions run out.
    pub fn set_fallback(&self, text: impl Into<String>) {
        self.state.lock().unwrap().fallback = Some(text.into());
    }

    /// Statuses returned by successive polls of `batch_id`; the last repeats.
    pub fn script_batch(&self, batch_id: &str, states: Vec<RemoteBatch>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .insert(batch_id.to_string(), states.into());
    }

    pub fn put_file(&self, file_id: &str, content: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(file_id.to_string(), content.into());
    }

    pub fn file(&self, file_id: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(file_id).cloned()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// `(batch id, completion window)` of every created batch.
    pub fn created_batches(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }
}

pub fn remote(batch_id: &str, status: RemoteBatchStatus) -> RemoteBatch {
    RemoteBatch {
        id: batch_id.to_string(),
        status,
        input_file_id: "file-input".to_string(),
        output_file_id: None,
        error_file_id: None,
        errors: None,
        request_counts: None,
    }
}

pub fn completed_remote(batch_id: &str, output: &str, errors: Option<&str>) -> RemoteBatch {
    RemoteBatch {
        output_file_id: Some(output.to_string()),
        error_file_id: errors.map(str::to_string),
        ..remote(batch_id, RemoteBatchStatus::Completed)
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        match state.completions.pop_front() {
            Some(reply) => reply,
            None => state.fallback.clone().ok_or(LlmError::EmptyContent),
        }
    }

    async fn upload_batch_file(&self, filename: &str, jsonl: Vec<u8>) -> Result<String, LlmError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        assert!(filename.ends_with(".jsonl"));
        state
            .files
            .insert(id.clone(), String::from_utf8(jsonl).expect("jsonl is utf-8"));
        Ok(id)
    }

    async fn create_batch(
        &self,
        input_file_id: &str,
        completion_window: &str,
    ) -> Result<RemoteBatch, LlmError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("batch-{}", state.next_id);
        state
            .created
            .push((id.clone(), completion_window.to_string()));
        Ok(RemoteBatch {
            input_file_id: input_file_id.to_string(),
            ..remote(&id, RemoteBatchStatus::Validating)
        })
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch, LlmError> {
        let mut state = self.state.lock().unwrap();
        let Some(script) = state.batches.get_mut(batch_id) else {
            return Ok(remote(batch_id, RemoteBatchStatus::InProgress));
        };
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(next.unwrap_or_else(|| remote(batch_id, RemoteBatchStatus::InProgress)))
    }

    async fn file_content(&self, file_id: &str) -> Result<String, LlmError> {
        self.file(file_id).ok_or_else(|| LlmError::Api {
            status: 404,
            message: format!("no file {file_id}"),
        })
    }
}

// ── Wiring ───────────────────────────────────────────────────────────

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn pipeline(llm: Arc<ScriptedLlm>, mode: ExtractionMode) -> ExtractionPipeline {
    let taxonomy = Arc::new(Taxonomy::builtin().expect("builtin taxonomy"));
    ExtractionPipeline::new(
        llm,
        taxonomy,
        PipelineSettings {
            model: "test-model".to_string(),
            temperature: 0.0,
            max_output_tokens: 2048,
            max_input_tokens: 8000,
            mode,
        },
    )
}

pub fn validator(processing_date: &str) -> FieldValidator {
    let taxonomy = Arc::new(Taxonomy::builtin().expect("builtin taxonomy"));
    FieldValidator::new(taxonomy, ProcessingDate::Fixed(processing_date.parse().expect("date")))
}

pub fn persistence(store: Arc<MemoryStore>) -> Persistence {
    Persistence::new(store, fast_retry())
}
