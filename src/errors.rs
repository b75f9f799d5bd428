//! Typed error hierarchy for the autoforge supervisor.
//!
//! Two top-level enums cover the two subsystems that callers match on:
//! - `OrchestratorError`: start/stop/pause requests against the agent manager
//! - `ClientError`: a single call through a code-generation backend

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the agent manager's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Agent already running for project '{project}'")]
    AlreadyRunning { project: String },

    #[error(
        "Stale run-lock for project '{project}' at {} (pid {pid:?}); run `autoforge reconcile --clear` after confirming no agent is running",
        path.display()
    )]
    StaleLock {
        project: String,
        path: PathBuf,
        pid: Option<u32>,
    },

    #[error("No agent running for project '{project}'")]
    NotRunning { project: String },

    #[error("Code-generation backend '{backend}' is not available: {detail}")]
    BackendUnavailable { backend: String, detail: String },

    #[error("Run-lock I/O failed at {}: {source}", path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Work-item store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from one `send_prompt` call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Throttling or quota exhaustion; the orchestrator backs off and retries.
    #[error("Rate limited by backend: {detail}")]
    RateLimited { detail: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Malformed backend response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}
