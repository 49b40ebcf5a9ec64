//! Adapter for OpenAI-compatible chat completion endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::ChunkSender;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streamed completion: every content delta is sent on `chunks` as it
    /// arrives, and the full text is returned at the end.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        chunks: ChunkSender,
    ) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const PROVIDER: &str = "openai";

/// OpenAI-compatible API adapter for chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120))
    }

    /// Create from environment variables.
    ///
    /// `TRIALCHAT_API_KEY` wins over `OPENAI_API_KEY`; `TRIALCHAT_BASE_URL` and
    /// `TRIALCHAT_TIMEOUT_SECONDS` are optional.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("TRIALCHAT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| ProviderError::config("OPENAI_API_KEY not set"))?;

        let base_url =
            std::env::var("TRIALCHAT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("TRIALCHAT_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, timeout)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    async fn send(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<(reqwest::Response, ErrorContext), ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();
        let api_req = ChatApiRequest {
            model: req.model.model_id(),
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream,
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let ctx = ErrorContext::new().with_status(response.status().as_u16());
        let ctx = match Self::extract_request_id(response.headers()) {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        Ok((response, ctx))
    }
}

/// Read a response body while enforcing the size limit.
async fn read_body(mut response: reqwest::Response) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::provider(
                PROVIDER,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn error_from_status(status: StatusCode, body: &str, ctx: ErrorContext) -> ProviderError {
    if let Ok(parsed) = serde_json::from_str::<ChatApiResponse>(body) {
        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            let ctx = match error.code {
                Some(code) => ctx.with_code(code),
                None => ctx,
            };
            return match status.as_u16() {
                429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
                _ => ProviderError::provider_with_context(
                    PROVIDER,
                    message,
                    status.is_server_error(),
                    ctx,
                ),
            };
        }
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::rate_limited(Duration::from_secs(60), ctx);
    }

    ProviderError::provider_with_context(
        PROVIDER,
        format!("HTTP {}", status.as_u16()),
        status.is_server_error(),
        ctx,
    )
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.content.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenAiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let (response, ctx) = self.send(req, false).await?;
        let status = response.status();
        let body = read_body(response).await?;

        if !status.is_success() {
            return Err(error_from_status(status, &body, ctx));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(PROVIDER, format!("Invalid JSON: {e}"), false))?;

        // API-level error inside a 200 body.
        if let Some(error) = parsed.error {
            return Err(ProviderError::provider_with_context(
                PROVIDER,
                error.message.unwrap_or_default(),
                false,
                ctx,
            ));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider(PROVIDER, "No choices in response", false))?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default()
            .trim()
            .to_string();

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        chunks: ChunkSender,
    ) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let (mut response, ctx) = self.send(req, true).await?;
        let status = response.status();

        if !status.is_success() {
            let body = read_body(response).await?;
            return Err(error_from_status(status, &body, ctx));
        }

        let mut pending = String::new();
        let mut content = String::new();
        let mut finish_reason = None;
        let mut done = false;

        while let Some(bytes) = response.chunk().await? {
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    done = true;
                    break;
                }

                let event: StreamChunk = serde_json::from_str(payload)
                    .map_err(|e| ProviderError::Stream(format!("bad event: {e}")))?;
                if let Some(error) = event.error {
                    return Err(ProviderError::provider_with_context(
                        PROVIDER,
                        error.message.unwrap_or_default(),
                        false,
                        ctx,
                    ));
                }
                for choice in event.choices {
                    if let Some(text) = choice.delta.and_then(|d| d.content) {
                        if content.len() + text.len() > MAX_RESPONSE_LEN {
                            return Err(ProviderError::provider(
                                PROVIDER,
                                "Streamed response too large",
                                false,
                            ));
                        }
                        content.push_str(&text);
                        // Receiver gone means nobody is rendering; keep collecting.
                        let _ = chunks.send(text);
                    }
                    if choice.finish_reason.is_some() {
                        finish_reason = choice.finish_reason;
                    }
                }
            }

            if done {
                break;
            }
        }

        Ok(ChatResponse {
            content: content.trim().to_string(),
            input_tokens: 0,
            output_tokens: 0,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(finish_reason),
        })
    }
}
