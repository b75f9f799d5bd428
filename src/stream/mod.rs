//! Decoding of the Claude CLI `--output-format stream-json` line protocol.
//!
//! Each stdout line is one JSON event. [`decode_line`] turns a line into the
//! pieces the CLI client cares about: text to stream, a one-line summary of a
//! tool call, an API error reported by the CLI, or the final result.

use serde::Deserialize;
use serde_json::Value;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
        /// Set when the message is a synthetic API error, e.g. `rate_limit`.
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },

    /// `user` tool-result echoes and any event type added later.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// One unit of output decoded from a stream-json line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Text(String),
    /// Short description of a tool invocation, e.g. `Editing: src/main.rs`.
    Action(String),
    Result { text: Option<String>, is_error: bool },
    /// Error kind the CLI attached to a synthetic assistant message.
    ApiError(String),
    /// A line that is not stream-json (stderr noise, banners). Passed through.
    Raw(String),
}

/// Decode one stdout line. Blank lines and bookkeeping events yield nothing.
pub fn decode_line(line: &str) -> Vec<StreamItem> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(StreamEvent::Assistant { message, error, .. }) => error
            .map(StreamItem::ApiError)
            .into_iter()
            .chain(message.content.into_iter().filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => Some(StreamItem::Text(text)),
                ContentBlock::ToolUse { name, input } => {
                    Some(StreamItem::Action(describe_tool_use(&name, &input)))
                }
                _ => None,
            }))
            .collect(),
        Ok(StreamEvent::Result {
            result, is_error, ..
        }) => vec![StreamItem::Result {
            text: result,
            is_error,
        }],
        Ok(StreamEvent::System { .. }) | Ok(StreamEvent::Other) => Vec::new(),
        Err(_) => vec![StreamItem::Raw(line.to_string())],
    }
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(|v| v.as_str())
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input_str(input, "file_path")
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input_str(input, "command")
                .map(|s| truncate_str(s, 60))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => format!("Searching: {}", input_str(input, "pattern").unwrap_or("*")),
        "Grep" => {
            let pattern = input_str(input, "pattern")
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        "Task" => format!(
            "Agent: {}",
            input_str(input, "description").unwrap_or("subagent")
        ),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate on a char boundary, appending an ellipsis when cut.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
