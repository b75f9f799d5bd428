use std::fmt;

use serde::{Deserialize, Serialize};

use crate::prompts::PromptKind;
use crate::store::WorkCounts;

/// What the next session should do. Recomputed from counts every iteration,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Coding,
    BuildValidating,
    Complete,
}

impl AgentPhase {
    /// Template for a session in this phase. `Complete` runs no session.
    pub fn prompt_kind(&self, yolo: bool) -> Option<PromptKind> {
        match self {
            AgentPhase::Initializing => Some(PromptKind::Initializer),
            AgentPhase::Coding if yolo => Some(PromptKind::CodingYolo),
            AgentPhase::Coding => Some(PromptKind::Coding),
            AgentPhase::BuildValidating => Some(PromptKind::BuildValidation),
            AgentPhase::Complete => None,
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentPhase::Initializing => "initializing",
            AgentPhase::Coding => "coding",
            AgentPhase::BuildValidating => "build_validating",
            AgentPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Phase for the given counts.
///
/// `validation_clean` is only meaningful once every item passes: it records
/// that the last validation session found no new failures.
pub fn compute_phase(counts: WorkCounts, validation_clean: bool) -> AgentPhase {
    if counts.total == 0 {
        AgentPhase::Initializing
    } else if counts.passing < counts.total {
        AgentPhase::Coding
    } else if validation_clean {
        AgentPhase::Complete
    } else {
        AgentPhase::BuildValidating
    }
}

/// Lifecycle of a project's worker as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Stopped,
    Running,
    Paused,
    Crashed,
}

impl AgentStatus {
    /// Whether a worker task should exist for this status.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Paused)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentStatus::Stopped => "stopped",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(total: u64, passing: u64) -> WorkCounts {
        WorkCounts { total, passing }
    }

    #[test]
    fn test_no_items_is_initializing() {
        assert_eq!(compute_phase(counts(0, 0), false), AgentPhase::Initializing);
        // A stale clean flag cannot skip initialization.
        assert_eq!(compute_phase(counts(0, 0), true), AgentPhase::Initializing);
    }

    #[test]
    fn test_pending_items_is_coding() {
        assert_eq!(compute_phase(counts(5, 0), false), AgentPhase::Coding);
        assert_eq!(compute_phase(counts(5, 4), true), AgentPhase::Coding);
    }

    #[test]
    fn test_all_passing_needs_validation() {
        assert_eq!(compute_phase(counts(5, 5), false), AgentPhase::BuildValidating);
        assert_eq!(compute_phase(counts(5, 5), true), AgentPhase::Complete);
    }

    #[test]
    fn test_validation_failures_return_to_coding() {
        // 5/5 passing, validation adds 2 failing items.
        assert_eq!(compute_phase(counts(7, 5), false), AgentPhase::Coding);
    }

    #[test]
    fn test_prompt_kind_per_phase() {
        assert_eq!(
            AgentPhase::Coding.prompt_kind(true),
            Some(PromptKind::CodingYolo)
        );
        assert_eq!(AgentPhase::Coding.prompt_kind(false), Some(PromptKind::Coding));
        assert_eq!(AgentPhase::Complete.prompt_kind(false), None);
    }

    #[test]
    fn test_status_activity() {
        assert!(AgentStatus::Running.is_active());
        assert!(AgentStatus::Paused.is_active());
        assert!(!AgentStatus::Crashed.is_active());
        assert_eq!(AgentStatus::default(), AgentStatus::Stopped);
    }
}
