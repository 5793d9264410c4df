//! Boundary to the LLM completion service.
//!
//! Everything that talks to the OpenAI-compatible HTTP API lives here, behind
//! the [`LlmService`] trait so the pipeline and the batch orchestrator can be
//! driven by fakes in tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::services::retry::{Classify, FailureClass, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Endpoint named in every batch input line.
pub const BATCH_ENDPOINT: &str = "/v1/chat/completions";

const REQUEST_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("reply cut off at the output token limit")]
    OutputTruncated,

    #[error("failed to decode service response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LlmError {
    /// Errors that make every further call in this run pointless.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, LlmError::Auth { .. } | LlmError::Quota(_))
    }
}

impl Classify for LlmError {
    fn failure_class(&self) -> FailureClass {
        match self {
            LlmError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                FailureClass::Transient
            }
            LlmError::Api { status, .. } if *status == 429 || *status >= 500 => {
                FailureClass::Transient
            }
            _ => FailureClass::Fatal,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    /// A request that asks the model for a single JSON object.
    pub fn json(model: &str, messages: Vec<ChatMessage>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            messages,
            temperature,
            max_tokens,
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletion {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessageOut,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageOut {
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ChatCompletion {
    pub fn text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// The reply text, unless the model stopped at the output token limit.
    pub fn reply(&self) -> Result<&str, LlmError> {
        let finish = self.choices.first().and_then(|c| c.finish_reason.as_deref());
        if finish == Some("length") {
            return Err(LlmError::OutputTruncated);
        }
        self.text().ok_or(LlmError::EmptyContent)
    }
}

/// One line of a batch input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatRequest,
}

impl BatchRequestLine {
    pub fn new(custom_id: String, body: ChatRequest) -> Self {
        Self {
            custom_id,
            method: "POST".to_string(),
            url: BATCH_ENDPOINT.to_string(),
            body,
        }
    }
}

/// One line of a batch output or error artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchOutputLine {
    pub custom_id: String,
    pub response: Option<BatchLineResponse>,
    pub error: Option<BatchLineError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchLineResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchLineError {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatchErrors {
    #[serde(default)]
    pub data: Vec<RemoteBatchErrorItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatchErrorItem {
    pub code: Option<String>,
    pub message: Option<String>,
    pub line: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// The service's view of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    pub status: RemoteBatchStatus,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub errors: Option<RemoteBatchErrors>,
    pub request_counts: Option<RequestCounts>,
}

impl RemoteBatch {
    /// Operator-facing reason for a terminal failure.
    pub fn failure_reason(&self) -> String {
        let messages: Vec<String> = self
            .errors
            .iter()
            .flat_map(|e| e.data.iter())
            .map(|item| match (&item.code, &item.message) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (None, Some(message)) => message.clone(),
                (Some(code), None) => code.clone(),
                (None, None) => "unspecified error".to_string(),
            })
            .collect();

        if messages.is_empty() {
            format!("batch reported status {:?}", self.status)
        } else {
            messages.join("; ")
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
}

// ── Service trait ────────────────────────────────────────────────────

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Synchronous completion; returns the model's text.
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;

    /// Upload a JSONL batch input artifact, returning its file id.
    async fn upload_batch_file(&self, filename: &str, jsonl: Vec<u8>) -> Result<String, LlmError>;

    async fn create_batch(
        &self,
        input_file_id: &str,
        completion_window: &str,
    ) -> Result<RemoteBatch, LlmError>;

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch, LlmError>;

    async fn file_content(&self, file_id: &str) -> Result<String, LlmError>;
}

/// Client for an OpenAI-compatible API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: &str, retry: RetryPolicy) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: retry.with_counter("llm_retries_total"),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a non-success response onto the error taxonomy.
async fn check(response: Response) -> Result<Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ApiErrorEnvelope>(&body).ok();
    let quota = parsed.as_ref().is_some_and(|e| {
        e.error.code.as_deref() == Some("insufficient_quota")
            || e.error.kind.as_deref() == Some("insufficient_quota")
    });
    let message = parsed.map(|e| e.error.message).unwrap_or(body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth {
            status: status.as_u16(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS if quota => LlmError::Quota(message),
        _ => LlmError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl LlmService for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let completion: ChatCompletion = self
            .retry
            .run("chat_completion", || async {
                let response = self
                    .http
                    .post(self.url("/chat/completions"))
                    .bearer_auth(&self.api_key)
                    .json(request)
                    .send()
                    .await?;
                Ok::<_, LlmError>(check(response).await?.json::<ChatCompletion>().await?)
            })
            .await?;

        if let Some(usage) = &completion.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion received"
            );
        }

        completion.reply().map(str::to_string)
    }

    async fn upload_batch_file(&self, filename: &str, jsonl: Vec<u8>) -> Result<String, LlmError> {
        let file: FileObject = self
            .retry
            .run("upload_batch_file", || async {
                let part = multipart::Part::bytes(jsonl.clone())
                    .file_name(filename.to_string())
                    .mime_str("application/jsonl")?;
                let form = multipart::Form::new().text("purpose", "batch").part("file", part);
                let response = self
                    .http
                    .post(self.url("/files"))
                    .bearer_auth(&self.api_key)
                    .multipart(form)
                    .send()
                    .await?;
                Ok::<_, LlmError>(check(response).await?.json::<FileObject>().await?)
            })
            .await?;
        Ok(file.id)
    }

    async fn create_batch(
        &self,
        input_file_id: &str,
        completion_window: &str,
    ) -> Result<RemoteBatch, LlmError> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": BATCH_ENDPOINT,
            "completion_window": completion_window,
        });
        self.retry
            .run("create_batch", || async {
                let response = self
                    .http
                    .post(self.url("/batches"))
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await?;
                Ok::<_, LlmError>(check(response).await?.json::<RemoteBatch>().await?)
            })
            .await
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch, LlmError> {
        self.retry
            .run("retrieve_batch", || async {
                let response = self
                    .http
                    .get(self.url(&format!("/batches/{batch_id}")))
                    .bearer_auth(&self.api_key)
                    .send()
                    .await?;
                Ok::<_, LlmError>(check(response).await?.json::<RemoteBatch>().await?)
            })
            .await
    }

    async fn file_content(&self, file_id: &str) -> Result<String, LlmError> {
        self.retry
            .run("file_content", || async {
                let response = self
                    .http
                    .get(self.url(&format!("/files/{file_id}/content")))
                    .bearer_auth(&self.api_key)
                    .send()
                    .await?;
                Ok::<_, LlmError>(check(response).await?.text().await?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_targets_chat_endpoint() {
        let body = ChatRequest::json("gpt-4o-mini", vec![ChatMessage::user("hi")], 0.0, 100);
        let line = serde_json::to_value(BatchRequestLine::new("resume-42".into(), body)).unwrap();
        assert_eq!(line["custom_id"], "resume-42");
        assert_eq!(line["method"], "POST");
        assert_eq!(line["url"], "/v1/chat/completions");
        assert_eq!(line["body"]["response_format"]["type"], "json_object");
        assert_eq!(line["body"]["messages"][0]["role"], "user");
    }

    #[test]
    fn test_remote_batch_decodes_service_payload() {
        let payload = r#"{
            "id": "batch_abc",
            "object": "batch",
            "status": "failed",
            "input_file_id": "file-in",
            "output_file_id": null,
            "error_file_id": null,
            "errors": {"object": "list", "data": [{"code": "invalid_json", "message": "line 3 is not JSON", "line": 3}]},
            "request_counts": {"total": 3, "completed": 0, "failed": 3}
        }"#;
        let batch: RemoteBatch = serde_json::from_str(payload).unwrap();
        assert_eq!(batch.status, RemoteBatchStatus::Failed);
        assert_eq!(batch.failure_reason(), "invalid_json: line 3 is not JSON");
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let payload = r#"{"id": "b", "status": "paused", "input_file_id": "f", "output_file_id": null,
            "error_file_id": null, "errors": null, "request_counts": null}"#;
        let batch: RemoteBatch = serde_json::from_str(payload).unwrap();
        assert_eq!(batch.status, RemoteBatchStatus::Unknown);
    }

    #[test]
    fn test_error_classes() {
        let transient = LlmError::Api {
            status: 503,
            message: "overloaded".into(),
        };
        assert_eq!(transient.failure_class(), FailureClass::Transient);

        let auth = LlmError::Auth {
            status: 401,
            message: "bad key".into(),
        };
        assert_eq!(auth.failure_class(), FailureClass::Fatal);
        assert!(auth.is_run_terminal());
        assert!(LlmError::Quota("out of credit".into()).is_run_terminal());
        assert!(!LlmError::EmptyContent.is_run_terminal());
    }

    #[test]
    fn test_reply_cut_at_the_token_limit_is_rejected() {
        let cut: ChatCompletion = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "{\"FirstName\": \"Ja"}, "finish_reason": "length"}]}"#,
        )
        .unwrap();
        assert!(matches!(cut.reply(), Err(LlmError::OutputTruncated)));

        let whole: ChatCompletion = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "{}"}, "finish_reason": "stop"}], "usage": null}"#,
        )
        .unwrap();
        assert_eq!(whole.reply().unwrap(), "{}");
    }
}
