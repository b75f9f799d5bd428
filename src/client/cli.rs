use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Backend, ChunkHandler, CodeGenClient, rate_limit, truncate};
use crate::errors::ClientError;
use crate::process::{CommandSpec, LineHandler, OutputStream, ProcessSupervisor};
use crate::stream::{StreamItem, decode_line};

/// Lines of stderr kept for the error message when the CLI fails.
const STDERR_TAIL: usize = 20;

/// Backend that drives the `claude` CLI as a supervised subprocess.
///
/// The prompt goes in on stdin; stdout is stream-json, one event per line.
/// The subprocess is registered with the supervisor under a per-session name
/// so `close` can tear down the whole tree.
pub struct ClaudeCliClient {
    name: String,
    claude_cmd: String,
    model: Option<String>,
    yolo: bool,
    allowed_tools: Vec<String>,
    tmp_dir: PathBuf,
    supervisor: ProcessSupervisor,
    readiness_timeout: Duration,
    cancel: CancellationToken,
}

impl ClaudeCliClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        claude_cmd: String,
        model: Option<String>,
        yolo: bool,
        allowed_tools: Vec<String>,
        tmp_dir: PathBuf,
        supervisor: ProcessSupervisor,
        readiness_timeout: Duration,
    ) -> Self {
        Self {
            name,
            claude_cmd,
            model,
            yolo,
            allowed_tools,
            tmp_dir,
            supervisor,
            readiness_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.name
    }

    fn settings_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("claude-settings-{}.json", self.name))
    }

    /// Command-line flags for one invocation. Attended mode writes the tool
    /// allow-list to a settings file first.
    fn flags(&self) -> Result<Vec<String>, ClientError> {
        let mut flags: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(ref model) = self.model {
            flags.push("--model".into());
            flags.push(model.clone());
        }
        if self.yolo {
            flags.push("--dangerously-skip-permissions".into());
        } else {
            let settings = serde_json::json!({
                "permissions": { "allow": self.allowed_tools }
            });
            std::fs::create_dir_all(&self.tmp_dir).map_err(|e| ClientError::Other(e.into()))?;
            let path = self.settings_path();
            std::fs::write(&path, serde_json::to_vec_pretty(&settings).unwrap_or_default())
                .map_err(|e| ClientError::Other(e.into()))?;
            flags.push("--settings".into());
            flags.push(path.display().to_string());
        }
        Ok(flags)
    }

    async fn rate_limited(&self, detail: &str) -> ClientError {
        tracing::warn!(name = %self.name, "Rate limit detected in CLI output");
        self.abort().await;
        ClientError::RateLimited {
            detail: truncate(detail.trim(), 300),
        }
    }

    async fn abort(&self) {
        if let Err(e) = self.supervisor.stop(&self.name).await {
            tracing::error!(name = %self.name, "Failed to stop CLI process: {:#}", e);
        }
    }
}

#[async_trait]
impl CodeGenClient for ClaudeCliClient {
    fn backend(&self) -> Backend {
        Backend::Cli
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

        let spec = CommandSpec::new(&self.claude_cmd)
            .args(self.flags()?)
            .cwd(working_dir)
            .stdin(prompt);

        let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
        let handler: LineHandler = Arc::new(move |stream, line| {
            let _ = tx.send((stream, line.to_string()));
        });

        self.supervisor
            .start(&self.name, spec, handler)
            .await
            .map_err(|e| match e.downcast::<std::io::Error>() {
                Ok(io) => ClientError::Spawn(io),
                Err(other) => ClientError::Other(other),
            })?;
        tracing::debug!(name = %self.name, cmd = %self.claude_cmd, "CLI session started");

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut result_is_error = false;
        let mut stderr_tail: Vec<String> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.abort().await;
                    return Err(ClientError::Cancelled);
                }
                next = rx.recv() => next,
            };
            // Channel closes once both output readers hit EOF.
            let Some((stream, line)) = next else { break };

            if stream == OutputStream::Stderr {
                tracing::debug!(name = %self.name, "stderr: {}", line);
                if rate_limit::detect(&line) {
                    return Err(self.rate_limited(&line).await);
                }
                stderr_tail.push(line);
                if stderr_tail.len() > STDERR_TAIL {
                    stderr_tail.remove(0);
                }
                continue;
            }

            // Only content the CLI itself produced is checked for throttling.
            // Event metadata and tool results echo arbitrary numbers and files.
            for item in decode_line(&line) {
                let chunk = match item {
                    StreamItem::Text(text) => text,
                    StreamItem::Action(action) => format!("> {}", action),
                    StreamItem::Raw(raw) => {
                        if rate_limit::detect(&raw) {
                            return Err(self.rate_limited(&raw).await);
                        }
                        raw
                    }
                    StreamItem::ApiError(kind) => {
                        if rate_limit::detect(&kind) {
                            return Err(self.rate_limited(&line).await);
                        }
                        tracing::warn!(name = %self.name, kind = %kind, "CLI reported an API error");
                        continue;
                    }
                    StreamItem::Result { text, is_error } => {
                        final_result = text;
                        result_is_error = is_error;
                        continue;
                    }
                };
                accumulated.push_str(&chunk);
                accumulated.push('\n');
                if on_chunk(&chunk).is_break() {
                    self.cancel.cancel();
                    break;
                }
            }
        }

        let exit = self.supervisor.wait(&self.name).await;
        // Sweeps background children the CLI left in its process group.
        self.abort().await;
        let code = exit.and_then(|e| e.code);

        if result_is_error || !exit.is_some_and(|e| e.success()) {
            let stderr = match (&final_result, result_is_error) {
                (Some(text), true) => text.clone(),
                _ => stderr_tail.join("\n"),
            };
            // Some CLI versions only report throttling in the final result text.
            if rate_limit::detect(&stderr) {
                return Err(ClientError::RateLimited { detail: stderr });
            }
            return Err(ClientError::Exited { code, stderr });
        }

        Ok(final_result.unwrap_or(accumulated))
    }

    async fn is_ready(&self) -> bool {
        let probe = Command::new(&self.claude_cmd)
            .arg("--version")
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.readiness_timeout, probe).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                tracing::warn!(cmd = %self.claude_cmd, "CLI readiness probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(cmd = %self.claude_cmd, "CLI readiness probe timed out");
                false
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.abort().await;
        let path = self.settings_path();
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}
