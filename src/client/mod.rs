//! Code-generation backends.
//!
//! A [`CodeGenClient`] runs one prompt against one backend and streams its
//! output. The orchestrator builds a fresh client per session through a
//! [`ClientFactory`] and closes it before the next one.
//!
//! | Backend | Type | Transport |
//! |---------|------|-----------|
//! | `cli` | [`ClaudeCliClient`] | `claude` subprocess, stream-json on stdout |
//! | `http` | [`HttpStreamClient`] | OpenAI-compatible `/chat/completions` SSE |
//! | `anthropic` | [`AnthropicClient`] | Anthropic Messages API SSE |

mod anthropic;
mod cli;
mod http;
pub mod rate_limit;
pub mod sse;

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AgentSection, AnthropicSection, Config, HttpSection};
use crate::errors::ClientError;
use crate::process::ProcessSupervisor;

pub use anthropic::AnthropicClient;
pub use cli::ClaudeCliClient;
pub use http::HttpStreamClient;

/// Receives each output unit as it arrives. Returning `Break` cancels the call.
pub type ChunkHandler<'a> = dyn FnMut(&str) -> ControlFlow<()> + Send + 'a;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cli,
    Http,
    Anthropic,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Cli => "cli",
            Backend::Http => "http",
            Backend::Anthropic => "anthropic",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" | "claude" => Ok(Backend::Cli),
            "http" | "openai" => Ok(Backend::Http),
            "anthropic" => Ok(Backend::Anthropic),
            other => anyhow::bail!("unknown backend '{}' (expected cli, http or anthropic)", other),
        }
    }
}

#[async_trait]
pub trait CodeGenClient: Send + Sync {
    fn backend(&self) -> Backend;

    /// Run `prompt` with `working_dir` as the project root, delivering output
    /// through `on_chunk` in arrival order. Returns the full response text.
    async fn send_prompt(
        &self,
        prompt: &str,
        working_dir: &Path,
        on_chunk: &mut ChunkHandler<'_>,
    ) -> Result<String, ClientError>;

    /// Cheap availability probe, bounded by the configured readiness timeout.
    async fn is_ready(&self) -> bool;

    /// Abort any in-flight call and release resources. Idempotent.
    async fn close(&self);
}

/// Everything a factory needs to build the client for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub project: String,
    pub working_dir: PathBuf,
    pub sequence: u64,
    pub yolo: bool,
    pub model: Option<String>,
}

pub trait ClientFactory: Send + Sync {
    fn create(&self, settings: &SessionSettings) -> Result<Arc<dyn CodeGenClient>, ClientError>;
}

/// Builds the configured backend variant.
pub struct BackendFactory {
    backend: Backend,
    agent: AgentSection,
    http: HttpSection,
    anthropic: AnthropicSection,
    claude_cmd: String,
    readiness_timeout: Duration,
    supervisor: ProcessSupervisor,
}

impl BackendFactory {
    pub fn new(config: &Config, supervisor: ProcessSupervisor) -> Self {
        Self {
            backend: config.toml.agent.backend,
            agent: config.toml.agent.clone(),
            http: config.toml.http.clone(),
            anthropic: config.toml.anthropic.clone(),
            claude_cmd: config.toml.claude_cmd(),
            readiness_timeout: Duration::from_secs(config.toml.limits.readiness_timeout_secs),
            supervisor,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl ClientFactory for BackendFactory {
    fn create(&self, settings: &SessionSettings) -> Result<Arc<dyn CodeGenClient>, ClientError> {
        let model = settings.model.clone().or_else(|| self.agent.model.clone());
        let client: Arc<dyn CodeGenClient> = match self.backend {
            Backend::Cli => Arc::new(ClaudeCliClient::new(
                format!("{}-session-{}", settings.project, settings.sequence),
                self.claude_cmd.clone(),
                model,
                settings.yolo,
                self.agent.allowed_tools.clone(),
                settings.working_dir.join(crate::config::STATE_DIR).join("tmp"),
                self.supervisor.clone(),
                self.readiness_timeout,
            )),
            Backend::Http => Arc::new(HttpStreamClient::new(
                &self.http,
                model,
                self.readiness_timeout,
            )?),
            Backend::Anthropic => Arc::new(AnthropicClient::new(
                &self.anthropic,
                model,
                self.readiness_timeout,
            )?),
        };
        tracing::debug!(
            project = %settings.project,
            session = settings.sequence,
            backend = %self.backend,
            "Client created"
        );
        Ok(client)
    }
}

/// Shared preamble for the HTTP backends, which cannot see the filesystem.
pub(crate) fn system_preamble(working_dir: &Path) -> String {
    format!(
        "You are an autonomous coding agent working on the project at {}.",
        working_dir.display()
    )
}

/// Map a non-success HTTP response to the client error taxonomy.
pub(crate) fn http_failure(status: reqwest::StatusCode, body: &str) -> ClientError {
    let overloaded = status.as_u16() == 529;
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || overloaded
        || rate_limit::detect(body)
        || body.contains("overloaded_error")
    {
        return ClientError::RateLimited {
            detail: format!("HTTP {}: {}", status, truncate(body, 300)),
        };
    }
    ClientError::Protocol(format!("HTTP {}: {}", status, truncate(body, 500)))
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
