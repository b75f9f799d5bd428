use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::sse::{self, FrameAction, SseFrame};
use super::{Backend, ChunkHandler, CodeGenClient, http_failure, system_preamble};
use crate::config::AnthropicSection;
use crate::errors::ClientError;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend with SSE streaming.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    readiness_timeout: Duration,
    cancel: CancellationToken,
}

impl AnthropicClient {
    pub fn new(
        settings: &AnthropicSection,
        model: Option<String>,
        readiness_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(readiness_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key_env: settings.api_key_env.clone(),
            api_key: std::env::var(&settings.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: model.unwrap_or_else(|| settings.default_model.clone()),
            max_tokens: settings.max_tokens,
            readiness_timeout,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ClientError::Unavailable(format!("{} is not set", self.api_key_env)))?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION))
    }
}

/// Decoded meaning of one Messages API stream event.
#[derive(Debug, PartialEq)]
enum MessageEvent {
    Text(String),
    Stop,
    Error { kind: String, message: String },
    Ignore,
}

fn classify(frame: &SseFrame) -> MessageEvent {
    let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
        return MessageEvent::Ignore;
    };
    let kind = frame
        .event
        .as_deref()
        .or_else(|| value.get("type").and_then(|v| v.as_str()))
        .unwrap_or_default();
    match kind {
        "content_block_delta" => {
            let delta = value.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(|v| v.as_str())
                .is_none_or(|t| t == "text_delta");
            match delta.and_then(|d| d.get("text")).and_then(|v| v.as_str()) {
                Some(text) if is_text && !text.is_empty() => MessageEvent::Text(text.to_string()),
                _ => MessageEvent::Ignore,
            }
        }
        "message_stop" => MessageEvent::Stop,
        "error" => MessageEvent::Error {
            kind: value
                .pointer("/error/type")
                .and_then(|v| v.as_str())
                .unwrap_or("error")
                .to_string(),
            message: value
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        },
        _ => MessageEvent::Ignore,
    }
}

fn stream_error(kind: &str, message: &str) -> ClientError {
    let detail = format!("{}: {}", kind, message);
    if kind == "rate_limit_error" || kind == "overloaded_error" || super::rate_limit::detect(message) {
        ClientError::RateLimited { detail }
    } else {
        ClientError::Protocol(detail)
    }
}

#[async_trait]
impl CodeGenClient for AnthropicClient {
    fn backend(&self) -> Backend {
        Backend::Anthropic
    }

    async fn send_prompt(
        &self,
        prompt: &str,
        working_dir: &Path,
        on_chunk: &mut ChunkHandler<'_>,
    ) -> Result<String, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "system": system_preamble(working_dir),
            "messages": [{"role": "user", "content": prompt}],
        });
        let request = self
            .request(reqwest::Method::POST, "/v1/messages")?
            .json(&body)
            .send();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            response = request => response?,
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(http_failure(status, &text));
        }

        let mut output = String::new();
        sse::drive(response, &self.cancel, |frame| match classify(&frame) {
            MessageEvent::Text(text) => {
                output.push_str(&text);
                if on_chunk(&text).is_break() {
                    return Err(ClientError::Cancelled);
                }
                Ok(FrameAction::Continue)
            }
            MessageEvent::Stop => Ok(FrameAction::Done),
            MessageEvent::Error { kind, message } => Err(stream_error(&kind, &message)),
            MessageEvent::Ignore => Ok(FrameAction::Continue),
        })
        .await?;

        Ok(output)
    }

    async fn is_ready(&self) -> bool {
        let Ok(request) = self.request(reqwest::Method::GET, "/v1/models") else {
            return false;
        };
        match tokio::time::timeout(self.readiness_timeout, request.send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                tracing::warn!("Anthropic readiness probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Anthropic readiness probe timed out");
                false
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
