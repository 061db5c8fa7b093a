use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_owned(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_owned(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing api key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response")]
    InvalidResponse,
    #[error("provider does not support structured output for this request")]
    UnsupportedResponseFormat,
    #[error("provider call timed out")]
    Timeout,
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
}

/// Per-model call/token counters, aggregated monotonically over a client's lifetime.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ModelUsage {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Mapping from model identifier to its aggregate usage.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UsageSummary {
    pub model_usage: HashMap<String, ModelUsage>,
}

impl UsageSummary {
    pub fn record(&mut self, model: &str, input_tokens: u64, output_tokens: u64) {
        let entry = self.model_usage.entry(model.to_owned()).or_default();
        entry.total_calls += 1;
        entry.total_input_tokens += input_tokens;
        entry.total_output_tokens += output_tokens;
    }

    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.model_usage {
            let entry = self.model_usage.entry(model.clone()).or_default();
            entry.total_calls += usage.total_calls;
            entry.total_input_tokens += usage.total_input_tokens;
            entry.total_output_tokens += usage.total_output_tokens;
        }
    }
}

/// A single call's token accounting, reported alongside the response text.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn completion(
        &self,
        messages: &[Message],
        max_completion_tokens: Option<u32>,
    ) -> Result<String, LlmError>;

    /// Structured-output variant. Implementations that cannot honor
    /// `response_format` must return `LlmError::UnsupportedResponseFormat`
    /// rather than silently falling back to free text.
    async fn completion_structured(
        &self,
        messages: &[Message],
        response_format: &Value,
    ) -> Result<String, LlmError> {
        let _ = (messages, response_format);
        Err(LlmError::UnsupportedResponseFormat)
    }

    fn get_usage_summary(&self) -> UsageSummary;
    fn get_last_usage(&self) -> Option<CallUsage>;
}

pub struct HttpLmClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    usage: Mutex<UsageSummary>,
    last_usage: Mutex<Option<CallUsage>>,
}

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 250;

impl HttpLmClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url,
            model,
            usage: Mutex::new(UsageSummary::default()),
            last_usage: Mutex::new(None),
        })
    }

    fn is_transient(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if Self::is_transient(status) {
                return Err(LlmError::Provider {
                    status: status.as_u16(),
                    message,
                });
            }
            return Err(LlmError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<ChatResponse>().await.map_err(LlmError::Http)
    }

    async fn send_with_retry(&self, body: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(LlmError::Provider { status, message }) if attempt < MAX_RETRIES => {
                    let retryable = StatusCode::from_u16(status)
                        .map(Self::is_transient)
                        .unwrap_or(false);
                    if !retryable {
                        return Err(LlmError::Provider { status, message });
                    }
                    let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt);
                    warn!(status, attempt, backoff, "retrying transient provider error");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpLmClient {
    async fn completion_inner(
        &self,
        messages: &[Message],
        max_completion_tokens: Option<u32>,
        response_format: Option<Value>,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            max_completion_tokens,
            response_format,
        };
        let parsed = self.send_with_retry(body).await?;
        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(LlmError::InvalidResponse)?;

        let usage = parsed
            .usage
            .map(|usage| CallUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();
        {
            let mut summary = self.usage.lock().expect("usage lock poisoned");
            summary.record(&self.model, usage.input_tokens, usage.output_tokens);
        }
        *self.last_usage.lock().expect("last usage lock poisoned") = Some(usage);
        debug!(model = %self.model, input = usage.input_tokens, output = usage.output_tokens, "lm call completed");

        Ok(content)
    }
}

#[async_trait]
impl LlmClient for HttpLmClient {
    async fn completion(
        &self,
        messages: &[Message],
        max_completion_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.completion_inner(messages, max_completion_tokens, None)
            .await
    }

    async fn completion_structured(
        &self,
        messages: &[Message],
        response_format: &Value,
    ) -> Result<String, LlmError> {
        self.completion_inner(messages, None, Some(response_format.clone()))
            .await
    }

    fn get_usage_summary(&self) -> UsageSummary {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    fn get_last_usage(&self) -> Option<CallUsage> {
        *self.last_usage.lock().expect("last usage lock poisoned")
    }
}

/// Deterministic client used by controller/parsing tests; never makes network calls.
#[cfg(any(test, feature = "test-util"))]
pub struct MockLmClient {
    pub responses: Mutex<Vec<String>>,
    usage: Mutex<UsageSummary>,
}

#[cfg(any(test, feature = "test-util"))]
impl MockLmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            usage: Mutex::new(UsageSummary::default()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl LlmClient for MockLmClient {
    async fn completion(
        &self,
        _messages: &[Message],
        _max_completion_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let mut responses = self.responses.lock().expect("mock lock poisoned");
        if responses.is_empty() {
            return Err(LlmError::InvalidResponse);
        }
        let response = responses.remove(0);
        self.usage
            .lock()
            .expect("usage lock poisoned")
            .record("mock", response.len() as u64 / 4, response.len() as u64 / 4);
        Ok(response)
    }

    fn get_usage_summary(&self) -> UsageSummary {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    fn get_last_usage(&self) -> Option<CallUsage> {
        None
    }
}
