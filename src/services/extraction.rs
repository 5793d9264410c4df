use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use strum::{Display, EnumString, IntoEnumIterator};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::field::{Field, RawFields};
use crate::models::resume::{ResumeRecord, UserId};
use crate::services::llm::{
    BatchOutputLine, BatchRequestLine, ChatCompletion, ChatMessage, ChatRequest, LlmError,
    LlmService,
};
use crate::services::prompts;
use crate::services::retry::{Classify, FailureClass};
use crate::services::taxonomy::Taxonomy;

const CUSTOM_ID_PREFIX: &str = "resume-";

/// Rough characters-per-token ratio for budget estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Taxonomy categories rendered into each kind of prompt.
const PROFILE_CONTEXT_CATEGORIES: usize = 2;
const EXPERTISE_CONTEXT_CATEGORIES: usize = 3;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("model output is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("model output is JSON but not an object")]
    NotAnObject,

    #[error("model output contains no recognised fields")]
    Empty,

    #[error("prompt alone needs {overhead} tokens, over the {budget} token input budget")]
    PromptTooLarge { overhead: usize, budget: usize },
}

impl ExtractionError {
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, ExtractionError::Llm(e) if e.is_run_terminal())
    }
}

impl Classify for ExtractionError {
    fn failure_class(&self) -> FailureClass {
        match self {
            ExtractionError::Llm(e) => e.failure_class(),
            // Malformed output is reported, the record stays unprocessed for a later run.
            _ => FailureClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionMode {
    /// Profile pass followed by an expertise pass that sees the first pass's output.
    TwoStep,
    /// Both field sets in a single request.
    OneStep,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_input_tokens: usize,
    pub mode: ExtractionMode,
}

/// Builds prompts, calls the model and parses its output into raw fields.
#[derive(Clone)]
pub struct ExtractionPipeline {
    llm: Arc<dyn LlmService>,
    taxonomy: Arc<Taxonomy>,
    settings: PipelineSettings,
}

impl ExtractionPipeline {
    pub fn new(llm: Arc<dyn LlmService>, taxonomy: Arc<Taxonomy>, settings: PipelineSettings) -> Self {
        Self {
            llm,
            taxonomy,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Extract one resume with synchronous completions.
    pub async fn extract(&self, record: &ResumeRecord) -> Result<RawFields, ExtractionError> {
        let started = Instant::now();
        let result = match self.settings.mode {
            ExtractionMode::OneStep => self.one_step(record).await,
            ExtractionMode::TwoStep => self.two_step(record).await,
        };
        metrics::histogram!("extraction_duration_seconds", "mode" => self.settings.mode.to_string())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn one_step(&self, record: &ResumeRecord) -> Result<RawFields, ExtractionError> {
        let request = self.unified_request(record)?;
        self.complete(request).await
    }

    async fn two_step(&self, record: &ResumeRecord) -> Result<RawFields, ExtractionError> {
        let context = self
            .taxonomy
            .prompt_context(&record.text, PROFILE_CONTEXT_CATEGORIES);
        let profile_request = self.request(record.user_id, &record.text, |text| {
            prompts::profile_messages(text, &self.taxonomy, &context)
        })?;
        let mut fields = self.complete(profile_request).await?;
        debug!(user_id = %record.user_id, fields = fields.len(), "Profile pass parsed");

        let context = self
            .taxonomy
            .prompt_context(&record.text, EXPERTISE_CONTEXT_CATEGORIES);
        let expertise_request = self.request(record.user_id, &record.text, |text| {
            prompts::expertise_messages(text, &self.taxonomy, &context, &fields)
        })?;
        let expertise = self.complete(expertise_request).await?;
        debug!(user_id = %record.user_id, fields = expertise.len(), "Expertise pass parsed");

        fields.merge(expertise);
        Ok(fields)
    }

    fn unified_request(&self, record: &ResumeRecord) -> Result<ChatRequest, ExtractionError> {
        let context = self
            .taxonomy
            .prompt_context(&record.text, PROFILE_CONTEXT_CATEGORIES);
        self.request(record.user_id, &record.text, |text| {
            prompts::unified_messages(text, &self.taxonomy, &context)
        })
    }

    async fn complete(&self, request: ChatRequest) -> Result<RawFields, ExtractionError> {
        let text = self.llm.complete(&request).await?;
        parse_completion(&text)
    }

    /// Build a request whose resume text fits the input token budget.
    fn request<F>(&self, user_id: UserId, text: &str, build: F) -> Result<ChatRequest, ExtractionError>
    where
        F: Fn(&str) -> Vec<ChatMessage>,
    {
        let overhead = estimate_messages(&build(""));
        let budget = self.settings.max_input_tokens.saturating_sub(overhead);
        if budget == 0 {
            return Err(ExtractionError::PromptTooLarge {
                overhead,
                budget: self.settings.max_input_tokens,
            });
        }
        let (kept, truncated) = truncate_to_budget(text, budget);
        if truncated {
            warn!(
                user_id = %user_id,
                original_tokens = estimate_tokens(text),
                kept_tokens = estimate_tokens(kept),
                "Resume text truncated to fit the input token budget"
            );
            metrics::counter!("resumes_truncated_total").increment(1);
        }
        Ok(ChatRequest::json(
            &self.settings.model,
            build(kept),
            self.settings.temperature,
            self.settings.max_output_tokens,
        ))
    }

    /// One batch input line for `record`. Batch requests are always one-step,
    /// since the expertise pass depends on the profile pass's output.
    pub fn batch_line(&self, record: &ResumeRecord) -> Result<BatchRequestLine, ExtractionError> {
        Ok(BatchRequestLine::new(
            custom_id(record.user_id),
            self.unified_request(record)?,
        ))
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn estimate_messages(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Keep the head of `text` within `max_tokens`; returns whether anything was dropped.
pub fn truncate_to_budget(text: &str, max_tokens: usize) -> (&str, bool) {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (&text[..cut], true),
        None => (text, false),
    }
}

pub fn custom_id(user_id: UserId) -> String {
    format!("{CUSTOM_ID_PREFIX}{user_id}")
}

pub fn parse_custom_id(custom_id: &str) -> Option<UserId> {
    custom_id
        .strip_prefix(CUSTOM_ID_PREFIX)?
        .parse()
        .ok()
        .map(UserId)
}

/// Recover the correlation id from a line too damaged to decode.
pub fn salvage_custom_id(line: &str) -> Option<UserId> {
    let after_key = &line[line.find("\"custom_id\"")? + "\"custom_id\"".len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?.trim_start();
    let value = after_colon.strip_prefix('"')?;
    parse_custom_id(&value[..value.find('"')?])
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(stripped) = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
    else {
        return text;
    };
    let stripped = stripped.trim_start();
    stripped
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(stripped)
}

fn field_for_key(key: &str) -> Option<Field> {
    Field::from_str(key)
        .ok()
        .or_else(|| Field::iter().find(|f| f.name().eq_ignore_ascii_case(key)))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Parse a completion into raw fields.
///
/// Missing keys stay absent (validated to null later), unknown keys are kept
/// as extras, and anything that is not a JSON object is an error.
pub fn parse_completion(text: &str) -> Result<RawFields, ExtractionError> {
    let value: Value =
        serde_json::from_str(strip_json_fences(text)).map_err(ExtractionError::MalformedJson)?;
    let Value::Object(map) = value else {
        return Err(ExtractionError::NotAnObject);
    };

    let mut fields = RawFields::new();
    let mut recognised = 0;
    for (key, value) in &map {
        match field_for_key(key) {
            Some(field) => {
                recognised += 1;
                if let Some(text) = value_text(value) {
                    fields.insert(field, text);
                }
            }
            None => {
                if let Some(text) = value_text(value) {
                    fields.insert_extra(key.as_str(), text);
                }
            }
        }
    }

    if recognised == 0 {
        return Err(ExtractionError::Empty);
    }
    Ok(fields)
}

/// One decoded line of a batch output artifact.
#[derive(Debug)]
pub enum LineOutcome {
    Parsed { user_id: UserId, fields: RawFields },
    Failed { user_id: Option<UserId>, reason: String },
}

/// Decode one output line. Never fails the caller: every problem becomes a
/// [`LineOutcome::Failed`] carrying whatever user id could be recovered.
pub fn parse_output_line(line: &str) -> LineOutcome {
    let decoded: BatchOutputLine = match serde_json::from_str(line) {
        Ok(decoded) => decoded,
        Err(e) => {
            return LineOutcome::Failed {
                user_id: salvage_custom_id(line),
                reason: format!("malformed output line: {e}"),
            }
        }
    };

    let Some(user_id) = parse_custom_id(&decoded.custom_id) else {
        return LineOutcome::Failed {
            user_id: None,
            reason: format!("unrecognised custom_id {:?}", decoded.custom_id),
        };
    };
    let failed = |reason: String| LineOutcome::Failed {
        user_id: Some(user_id),
        reason,
    };

    if let Some(error) = decoded.error {
        return failed(match error.code {
            Some(code) => format!("{code}: {}", error.message),
            None => error.message,
        });
    }
    let Some(response) = decoded.response else {
        return failed("output line has neither response nor error".to_string());
    };
    if response.status_code != 200 {
        return failed(format!("request returned status {}", response.status_code));
    }

    let completion: ChatCompletion = match serde_json::from_value(response.body) {
        Ok(completion) => completion,
        Err(e) => return failed(format!("undecodable completion body: {e}")),
    };
    let text = match completion.reply() {
        Ok(text) => text,
        Err(e) => return failed(ExtractionError::Llm(e).to_string()),
    };

    match parse_completion(text) {
        Ok(fields) => LineOutcome::Parsed { user_id, fields },
        Err(e) => failed(e.to_string()),
    }
}
