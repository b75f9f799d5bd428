use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::phase::{AgentPhase, AgentStatus};

/// One agent invocation. Built per iteration, logged, then dropped.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub project: String,
    pub working_dir: PathBuf,
    pub sequence: u64,
    pub phase: AgentPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub yolo: bool,
    pub model: Option<String>,
    /// Attempt number within the session; above 1 after rate-limit retries.
    pub attempt: u32,
    pub outcome: Option<String>,
    #[serde(skip)]
    pub response: Option<String>,
}

impl Session {
    pub fn new(
        project: &str,
        working_dir: &Path,
        sequence: u64,
        phase: AgentPhase,
        yolo: bool,
        model: Option<String>,
    ) -> Self {
        Self {
            project: project.to_string(),
            working_dir: working_dir.to_path_buf(),
            sequence,
            phase,
            started_at: Utc::now(),
            ended_at: None,
            yolo,
            model,
            attempt: 1,
            outcome: None,
            response: None,
        }
    }

    pub fn finish(&mut self, outcome: impl Into<String>, response: Option<String>) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome.into());
        self.response = response;
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    fn log_file_name(&self) -> String {
        format!(
            "session-{}-{:04}-{}-{}.md",
            self.started_at.format("%Y%m%d-%H%M%S"),
            self.sequence,
            self.phase,
            self.attempt
        )
    }

    /// Write the session header and raw response to `log_dir`.
    pub fn write_log(&self, log_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
        let header = serde_json::to_string_pretty(self).context("Failed to serialize session")?;
        let body = format!(
            "```json\n{}\n```\n\n{}\n",
            header,
            self.response.as_deref().unwrap_or("")
        );
        let path = log_dir.join(self.log_file_name());
        std::fs::write(&path, body).context("Failed to write session log")?;
        Ok(path)
    }
}

/// Why a worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Every item passes and the last validation found nothing new.
    Completed,
    /// Cancelled by `stop` or shutdown.
    Stopped,
    RateLimitExhausted { attempts: u32, detail: String },
    ValidationCycleLimit { cycles: u32 },
    Crashed(String),
}

impl LoopExit {
    pub fn status(&self) -> AgentStatus {
        match self {
            LoopExit::Completed | LoopExit::Stopped | LoopExit::ValidationCycleLimit { .. } => {
                AgentStatus::Stopped
            }
            LoopExit::RateLimitExhausted { .. } | LoopExit::Crashed(_) => AgentStatus::Crashed,
        }
    }

    /// Final human-readable message for observers.
    pub fn message(&self) -> String {
        match self {
            LoopExit::Completed => "All features pass and the build is clean".to_string(),
            LoopExit::Stopped => "Agent stopped".to_string(),
            LoopExit::RateLimitExhausted { attempts, detail } => format!(
                "Rate limited {} times in a row; giving up. Last message: {}",
                attempts, detail
            ),
            LoopExit::ValidationCycleLimit { cycles } => format!(
                "Build validation did not converge after {} cycles; stopping as complete",
                cycles
            ),
            LoopExit::Crashed(reason) => format!("Agent crashed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_log_contains_header_and_response() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(
            "demo",
            Path::new("/work/demo"),
            3,
            AgentPhase::Coding,
            false,
            Some("m".into()),
        );
        session.finish("completed", Some("Implemented login".into()));

        let path = session.write_log(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("-0003-coding-1"));

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"sequence\": 3"));
        assert!(content.contains("\"outcome\": \"completed\""));
        assert!(content.contains("Implemented login"));
        assert!(session.duration_secs().is_some());
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(LoopExit::Completed.status(), AgentStatus::Stopped);
        assert_eq!(LoopExit::Stopped.status(), AgentStatus::Stopped);
        assert_eq!(
            LoopExit::ValidationCycleLimit { cycles: 10 }.status(),
            AgentStatus::Stopped
        );
        assert_eq!(
            LoopExit::RateLimitExhausted {
                attempts: 3,
                detail: "429".into()
            }
            .status(),
            AgentStatus::Crashed
        );
        assert_eq!(LoopExit::Crashed("x".into()).status(), AgentStatus::Crashed);
    }

    #[test]
    fn test_exit_messages_are_readable() {
        let msg = LoopExit::RateLimitExhausted {
            attempts: 3,
            detail: "usage limit".into(),
        }
        .message();
        assert!(msg.contains("Rate limited 3 times"));
        assert!(LoopExit::Crashed("boom".into()).message().contains("boom"));
    }
}
