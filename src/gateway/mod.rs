//! Completion gateway: the capability the orchestrator calls to produce replies.

pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use openai::{ChatProvider, OpenAiAdapter};
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Channel on which streamed content deltas are delivered.
pub type ChunkSender = mpsc::UnboundedSender<String>;

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streamed variant. Gateways without incremental output deliver the whole
    /// reply as a single chunk.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        chunks: ChunkSender,
    ) -> Result<ChatResponse, ProviderError> {
        let resp = self.chat(req).await?;
        let _ = chunks.send(resp.content.clone());
        Ok(resp)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transport-level retries for retryable provider errors. Turns are never
    /// retried by the orchestrator itself.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl GatewayConfig {
    /// Read `TRIALCHAT_MAX_RETRIES` from the environment, defaulting to none.
    pub fn from_env() -> Self {
        let max_retries = std::env::var("TRIALCHAT_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: OpenAiAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.call(req, None).await
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        chunks: ChunkSender,
    ) -> Result<ChatResponse, ProviderError> {
        self.call(req, Some(chunks)).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let provider = OpenAiAdapter::from_env()?;
        Ok(Self {
            provider,
            usage_sink,
            config: GatewayConfig::from_env(),
        })
    }

    pub fn with_config(provider: OpenAiAdapter, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    async fn call(
        &self,
        req: ChatRequest,
        chunks: Option<ChunkSender>,
    ) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = match &chunks {
                Some(tx) => self.provider.chat_stream(&req, tx.clone()).await,
                None => self.provider.chat(&req).await,
            };
            match result {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(&req, None, CallStatus::Error, Some(code))
                        .await;

                    // A partially streamed reply cannot be replayed.
                    let streamed_partial = chunks.is_some();
                    if !err.is_retryable() || streamed_partial || attempt == self.config.max_retries
                    {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::warn!(attempt, code = err.code(), "retrying completion call");
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::provider("openai", "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let mut record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .session(req.attribution.session_id, req.attribution.turn)
        .streamed(req.stream);

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64);
        }

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
