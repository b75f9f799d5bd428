use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{AgentPhase, AgentStatus};

/// Events fanned out to observers of a project.
///
/// Serialized as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum HubEvent {
    Progress {
        phase: AgentPhase,
        passing: u64,
        total: u64,
        percentage: f64,
    },
    /// One chunk of live agent output.
    Log {
        line: String,
        timestamp: DateTime<Utc>,
    },
    FeatureUpdate {
        total: u64,
        passing: u64,
        previous_total: u64,
        previous_passing: u64,
    },
    /// Agent status change, with a human-readable reason for terminal states.
    Status {
        status: AgentStatus,
        message: String,
    },
    SessionStarted {
        sequence: u64,
        phase: AgentPhase,
    },
    SessionCompleted {
        sequence: u64,
        phase: AgentPhase,
    },
    Warning {
        message: String,
    },
}

impl HubEvent {
    pub fn log(line: impl Into<String>) -> Self {
        HubEvent::Log {
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn progress(phase: AgentPhase, passing: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (passing as f64 / total as f64 * 1000.0).round() / 10.0
        };
        HubEvent::Progress {
            phase,
            passing,
            total,
            percentage,
        }
    }

    pub fn status(status: AgentStatus, message: impl Into<String>) -> Self {
        HubEvent::Status {
            status,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::Progress { .. } => "Progress",
            HubEvent::Log { .. } => "Log",
            HubEvent::FeatureUpdate { .. } => "FeatureUpdate",
            HubEvent::Status { .. } => "Status",
            HubEvent::SessionStarted { .. } => "SessionStarted",
            HubEvent::SessionCompleted { .. } => "SessionCompleted",
            HubEvent::Warning { .. } => "Warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let event = HubEvent::status(AgentStatus::Crashed, "Rate limit retries exhausted");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Status\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"status\":\"crashed\""));
        assert!(json.contains("Rate limit retries exhausted"));
    }

    #[test]
    fn test_progress_percentage() {
        match HubEvent::progress(AgentPhase::Coding, 1, 3) {
            HubEvent::Progress { percentage, .. } => assert_eq!(percentage, 33.3),
            other => panic!("unexpected {other:?}"),
        }
        match HubEvent::progress(AgentPhase::Initializing, 0, 0) {
            HubEvent::Progress { percentage, .. } => assert_eq!(percentage, 0.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_progress_serialization_uses_snake_case_phase() {
        let json = serde_json::to_string(&HubEvent::progress(AgentPhase::BuildValidating, 5, 5))
            .unwrap();
        assert!(json.contains("\"type\":\"Progress\""));
        assert!(json.contains("\"phase\":\"build_validating\""));
        assert!(json.contains("\"percentage\":100.0"));
    }

    #[test]
    fn test_kind_matches_serde_tag() {
        let events = [
            HubEvent::log("x"),
            HubEvent::Warning { message: "w".into() },
            HubEvent::SessionStarted {
                sequence: 1,
                phase: AgentPhase::Coding,
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn test_roundtrip_feature_update() {
        let event = HubEvent::FeatureUpdate {
            total: 5,
            passing: 2,
            previous_total: 0,
            previous_passing: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: HubEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
