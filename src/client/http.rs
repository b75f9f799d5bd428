use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::sse::{self, FrameAction};
use super::{Backend, ChunkHandler, CodeGenClient, http_failure, rate_limit, system_preamble};
use crate::config::HttpSection;
use crate::errors::ClientError;

/// OpenAI-compatible chat-completions backend with SSE streaming.
pub struct HttpStreamClient {
    client: reqwest::Client,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    model: String,
    readiness_timeout: Duration,
    cancel: CancellationToken,
}

impl HttpStreamClient {
    pub fn new(
        settings: &HttpSection,
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
            readiness_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an explicit key instead of the configured environment variable.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn api_key(&self) -> Result<&str, ClientError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ClientError::Unavailable(format!("{} is not set", self.api_key_env)))
    }
}

/// Pull the text delta out of one chat-completions stream payload.
fn delta_text(value: &Value) -> String {
    value
        .get("choices")
        .and_then(|v| v.as_array())
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/delta/content").and_then(|v| v.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn payload_error(value: &Value) -> Option<ClientError> {
    let error = value.get("error")?;
    let detail = error
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let kind = error.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if rate_limit::detect(&detail) || rate_limit::detect(kind) {
        Some(ClientError::RateLimited { detail })
    } else {
        Some(ClientError::Protocol(detail))
    }
}

#[async_trait]
impl CodeGenClient for HttpStreamClient {
    fn backend(&self) -> Backend {
        Backend::Http
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
        let key = self.api_key()?;
        let body = json!({
            "model": self.model,
            "stream": true,
            "messages": [
                {"role": "system", "content": system_preamble(working_dir)},
                {"role": "user", "content": prompt},
            ],
        });

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
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
        sse::drive(response, &self.cancel, |frame| {
            if frame.is_done() {
                return Ok(FrameAction::Done);
            }
            let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                tracing::debug!("Skipping non-JSON SSE payload");
                return Ok(FrameAction::Continue);
            };
            if let Some(err) = payload_error(&value) {
                return Err(err);
            }
            let text = delta_text(&value);
            if !text.is_empty() {
                output.push_str(&text);
                if on_chunk(&text).is_break() {
                    return Err(ClientError::Cancelled);
                }
            }
            Ok(FrameAction::Continue)
        })
        .await?;

        Ok(output)
    }

    async fn is_ready(&self) -> bool {
        let Ok(key) = self.api_key() else {
            return false;
        };
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(key)
            .send();
        match tokio::time::timeout(self.readiness_timeout, probe).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                tracing::warn!("HTTP backend readiness probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("HTTP backend readiness probe timed out");
                false
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
