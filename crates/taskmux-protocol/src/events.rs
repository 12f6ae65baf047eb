use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Reference to a payload stored out of line next to the session log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// Path relative to the log root directory.
    pub path: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub content_hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// A text payload that is either carried in the log line or off-loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Payload {
    Inline(String),
    Artifact(ArtifactRef),
}

impl Payload {
    pub fn as_inline(&self) -> Option<&str> {
        match self {
            Payload::Inline(text) => Some(text),
            Payload::Artifact(_) => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactRef> {
        match self {
            Payload::Artifact(artifact) => Some(artifact),
            Payload::Inline(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Inline(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Inline(value.to_string())
    }
}

/// Typed body of one event-log entry. Serialized with a `type` tag next to
/// the entry's envelope fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<Payload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_path: Option<String>,
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    UserMessage {
        content: Payload,
    },
    AssistantMessage {
        content: Payload,
    },
    ToolCallStarted {
        tool_call_id: String,
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    ToolCallFinished {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        duration_ms: u64,
        output: Payload,
    },
    Status {
        message: String,
    },
    /// Raw PTY output. Logged so terminal bytes share the session sequence.
    TerminalChunk {
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
        has_ansi: bool,
    },
    /// Rendered screen captured once the process has exited.
    TerminalOutput {
        text: Payload,
        rows: u16,
        cols: u16,
    },
    Error {
        kind: String,
        message: String,
    },
    SessionEnded {
        success: bool,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl SessionEvent {
    /// The serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::UserMessage { .. } => "user_message",
            SessionEvent::AssistantMessage { .. } => "assistant_message",
            SessionEvent::ToolCallStarted { .. } => "tool_call_started",
            SessionEvent::ToolCallFinished { .. } => "tool_call_finished",
            SessionEvent::Status { .. } => "status",
            SessionEvent::TerminalChunk { .. } => "terminal_chunk",
            SessionEvent::TerminalOutput { .. } => "terminal_output",
            SessionEvent::Error { .. } => "error",
            SessionEvent::SessionEnded { .. } => "session_ended",
        }
    }

    /// Text payloads eligible for artifact off-loading, keyed by field name.
    pub fn payloads_mut(&mut self) -> Vec<(&'static str, &mut Payload)> {
        match self {
            SessionEvent::SessionStarted {
                description: Some(description),
                ..
            } => vec![("description", description)],
            SessionEvent::UserMessage { content } | SessionEvent::AssistantMessage { content } => {
                vec![("content", content)]
            }
            SessionEvent::ToolCallFinished { output, .. } => vec![("output", output)],
            SessionEvent::TerminalOutput { text, .. } => vec![("terminal", text)],
            _ => Vec::new(),
        }
    }
}

/// One immutable line of a session's event log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl LogEntry {
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}
