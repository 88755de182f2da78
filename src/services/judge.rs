//! Judge client for LLM-as-judge calls
//!
//! Provides the [`JudgeClient`] boundary used by every evaluator call and an
//! Anthropic implementation covering:
//! - Synchronous single completions (Messages API)
//! - Asynchronous batches (Message Batches API), addressed by custom id

use crate::config::JudgeConfig;
use crate::error::{JudgeloopError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Chat role of a judge message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One part of a multi-part message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

/// Message content: plain text or a list of text/image parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the content, images skipped
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// A judge request: ordered messages plus an optional output schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub messages: Vec<ChatMessage>,

    /// Description of the structured output the judge must return
    #[serde(default)]
    pub output_schema: Option<String>,

    /// Model override for this call
    #[serde(default)]
    pub model: Option<String>,
}

impl JudgeRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            output_schema: None,
            model: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One text completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCompletion {
    pub text: String,
    pub usage: Usage,
}

/// A request inside a batch submission
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub custom_id: String,
    pub request: JudgeRequest,
}

/// Provider-side processing state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderBatchStatus {
    InProgress,
    Ended,
    /// Canceled or expired; no results will arrive
    Failed,
}

/// Provider-side request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub processing: u64,
    pub succeeded: u64,
    pub errored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderBatchState {
    pub status: ProviderBatchStatus,
    pub counts: BatchCounts,
}

/// One result line of a finished batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResultLine {
    pub custom_id: String,

    /// Completion text, or the provider's error message for this request
    pub outcome: std::result::Result<String, String>,
}

/// External LLM judge capability
#[async_trait]
pub trait JudgeClient: Send + Sync {
    /// Run one synchronous completion
    async fn complete(&self, request: &JudgeRequest) -> Result<JudgeCompletion>;

    /// Submit many requests as one asynchronous job; returns the job id
    async fn create_batch(&self, requests: &[BatchRequest]) -> Result<String>;

    /// Query a job's processing state
    async fn batch_status(&self, batch_id: &str) -> Result<ProviderBatchState>;

    /// Retrieve one result line per custom id of an ended job
    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultLine>>;
}

/// Anthropic Messages API request format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Url { url: String },
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Serialize)]
struct BatchCreateRequest {
    requests: Vec<BatchEntry>,
}

#[derive(Debug, Serialize)]
struct BatchEntry {
    custom_id: String,
    params: AnthropicRequest,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: BatchRequestCounts,
    #[serde(default)]
    results_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchRequestCounts {
    #[serde(default)]
    processing: u64,
    #[serde(default)]
    succeeded: u64,
    #[serde(default)]
    errored: u64,
    #[serde(default)]
    canceled: u64,
    #[serde(default)]
    expired: u64,
}

#[derive(Debug, Deserialize)]
struct BatchResultEnvelope {
    custom_id: String,
    result: BatchResultBody,
}

#[derive(Debug, Deserialize)]
struct BatchResultBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<AnthropicResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic-backed judge
pub struct AnthropicJudge {
    config: JudgeConfig,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicJudge {
    /// Create a judge client with explicit provider configuration
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let api_key = config.resolved_api_key();
        if api_key.is_empty() {
            return Err(JudgeloopError::InvalidConfig(
                "judge API key not set (judge.api_key or ANTHROPIC_API_KEY)".to_string(),
            ));
        }

        if config.provider != "anthropic" {
            return Err(JudgeloopError::InvalidConfig(format!(
                "unsupported judge provider: {}",
                config.provider
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    /// Translate a judge request into the provider's wire format
    fn build_request(&self, request: &JudgeRequest) -> AnthropicRequest {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(message.content.text()),
                Role::User | Role::Assistant => {
                    let content = match &message.content {
                        MessageContent::Text(text) => vec![AnthropicContent::Text { text: text.clone() }],
                        MessageContent::Parts(parts) => parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => AnthropicContent::Text { text: text.clone() },
                                ContentPart::Image { url } => AnthropicContent::Image {
                                    source: ImageSource::Url { url: url.clone() },
                                },
                            })
                            .collect(),
                    };
                    messages.push(AnthropicMessage {
                        role: if message.role == Role::User { "user" } else { "assistant" },
                        content,
                    });
                }
            }
        }

        if let Some(schema) = &request.output_schema {
            system_parts.push(format!(
                "Respond ONLY with JSON matching this structure, no prose:\n{}",
                schema
            ));
        }

        AnthropicRequest {
            model: request.model.clone().unwrap_or_else(|| self.config.model.clone()),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        Err(JudgeloopError::Provider(format!(
            "API request failed with status {}: {}",
            status, error_text
        )))
    }

    fn completion_text(response: AnthropicResponse) -> Result<JudgeCompletion> {
        let usage = response
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        let text: String = response
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(JudgeloopError::Provider("Empty response from API".to_string()));
        }

        Ok(JudgeCompletion { text, usage })
    }

    fn batch_state(response: &BatchResponse) -> ProviderBatchState {
        let counts = &response.request_counts;
        let status = match response.processing_status.as_str() {
            "ended" => {
                // A batch that ended with nothing succeeded or errored was canceled/expired
                if counts.succeeded == 0 && counts.errored == 0 && (counts.canceled > 0 || counts.expired > 0) {
                    ProviderBatchStatus::Failed
                } else {
                    ProviderBatchStatus::Ended
                }
            }
            "canceling" => ProviderBatchStatus::Failed,
            _ => ProviderBatchStatus::InProgress,
        };

        ProviderBatchState {
            status,
            counts: BatchCounts {
                processing: counts.processing,
                succeeded: counts.succeeded,
                errored: counts.errored + counts.canceled + counts.expired,
            },
        }
    }

    async fn fetch_batch(&self, batch_id: &str) -> Result<BatchResponse> {
        let response = self
            .authed(self.client.get(self.url(&format!("/v1/messages/batches/{}", batch_id))))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| JudgeloopError::Parse(format!("Failed to parse batch response: {}", e)))
    }
}

/// Parse one JSONL line of a batch results file
fn parse_result_line(line: &str) -> Result<BatchResultLine> {
    let envelope: BatchResultEnvelope = serde_json::from_str(line)
        .map_err(|e| JudgeloopError::Parse(format!("Invalid batch result line: {}", e)))?;

    let outcome = match (envelope.result.kind.as_str(), envelope.result.message) {
        ("succeeded", Some(message)) => AnthropicJudge::completion_text(message)
            .map(|c| c.text)
            .map_err(|e| e.to_string()),
        (kind, _) => Err(envelope
            .result
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("request {}", kind))),
    };

    Ok(BatchResultLine {
        custom_id: envelope.custom_id,
        outcome,
    })
}

#[async_trait]
impl JudgeClient for AnthropicJudge {
    async fn complete(&self, request: &JudgeRequest) -> Result<JudgeCompletion> {
        debug!("Calling judge model");

        let body = self.build_request(request);
        let response = self
            .authed(self.client.post(self.url("/v1/messages")))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| JudgeloopError::Provider(format!("Failed to parse response: {}", e)))?;

        Self::completion_text(api_response)
    }

    async fn create_batch(&self, requests: &[BatchRequest]) -> Result<String> {
        if requests.is_empty() {
            return Err(JudgeloopError::StateConflict(
                "refusing to submit an empty batch".to_string(),
            ));
        }

        let body = BatchCreateRequest {
            requests: requests
                .iter()
                .map(|r| BatchEntry {
                    custom_id: r.custom_id.clone(),
                    params: self.build_request(&r.request),
                })
                .collect(),
        };

        let response = self
            .authed(self.client.post(self.url("/v1/messages/batches")))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| JudgeloopError::Provider(format!("Failed to parse batch response: {}", e)))?;

        info!("Submitted judge batch {} with {} requests", batch.id, requests.len());
        Ok(batch.id)
    }

    async fn batch_status(&self, batch_id: &str) -> Result<ProviderBatchState> {
        let batch = self.fetch_batch(batch_id).await?;
        Ok(Self::batch_state(&batch))
    }

    async fn batch_results(&self, batch_id: &str) -> Result<Vec<BatchResultLine>> {
        let batch = self.fetch_batch(batch_id).await?;
        let results_url = batch.results_url.ok_or_else(|| {
            JudgeloopError::StateConflict(format!("batch {} has no results yet", batch_id))
        })?;

        let response = self.authed(self.client.get(&results_url)).send().await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;

        let mut lines = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match parse_result_line(line) {
                Ok(parsed) => lines.push(parsed),
                Err(e) => warn!("Skipping unreadable result line in batch {}: {}", batch_id, e),
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judge() -> AnthropicJudge {
        AnthropicJudge::new(JudgeConfig {
            api_key: "test-key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_system_messages_are_hoisted() {
        let request = JudgeRequest::new(vec![
            ChatMessage::system("You grade extractions."),
            ChatMessage::user_parts(vec![
                ContentPart::Text { text: "Input: x".to_string() },
                ContentPart::Image { url: "https://example.com/a.png".to_string() },
            ]),
        ])
        .with_schema("{\"score\": number}");

        let wire = judge().build_request(&request);
        let system = wire.system.unwrap();
        assert!(system.starts_with("You grade extractions."));
        assert!(system.contains("{\"score\": number}"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].content.len(), 2);

        let json = serde_json::to_value(&wire.messages[0]).unwrap();
        assert_eq!(json["content"][1]["type"], "image");
        assert_eq!(json["content"][1]["source"]["type"], "url");
    }

    #[test]
    fn test_model_override() {
        let request = JudgeRequest::new(vec![ChatMessage::user("hi")]).with_model(Some("other".into()));
        assert_eq!(judge().build_request(&request).model, "other");
    }

    #[test]
    fn test_parse_result_lines() {
        let ok = r#"{"custom_id":"abc__correctness","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"{\"score\":9}"}]}}}"#;
        let line = parse_result_line(ok).unwrap();
        assert_eq!(line.custom_id, "abc__correctness");
        assert_eq!(line.outcome.unwrap(), "{\"score\":9}");

        let errored = r#"{"custom_id":"abc__format","result":{"type":"errored","error":{"type":"overloaded_error"}}}"#;
        let line = parse_result_line(errored).unwrap();
        assert!(line.outcome.is_err());
    }

    #[test]
    fn test_batch_state_mapping() {
        let response = BatchResponse {
            id: "b1".into(),
            processing_status: "ended".into(),
            request_counts: BatchRequestCounts {
                succeeded: 3,
                errored: 1,
                ..Default::default()
            },
            results_url: Some("https://example.com/r".into()),
        };
        let state = AnthropicJudge::batch_state(&response);
        assert_eq!(state.status, ProviderBatchStatus::Ended);
        assert_eq!(state.counts.succeeded, 3);

        let expired = BatchResponse {
            id: "b2".into(),
            processing_status: "ended".into(),
            request_counts: BatchRequestCounts {
                expired: 4,
                ..Default::default()
            },
            results_url: None,
        };
        assert_eq!(AnthropicJudge::batch_state(&expired).status, ProviderBatchStatus::Failed);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let result = AnthropicJudge::new(JudgeConfig::default());
        assert!(matches!(result, Err(JudgeloopError::InvalidConfig(_))));
    }
}
