use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mux::MuxEvent;
use crate::{SessionId, TaskId, TaskState};

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub project_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active_task_id: Option<TaskId>,
    pub task_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionList {
    pub sessions: Vec<SessionInfo>,
    pub total: usize,
}

/// How to launch the agent process. Built by an upstream command factory.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CommandDescriptor {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StartTaskRequest {
    pub command: CommandDescriptor,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub session_id: SessionId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub stream_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CancelResponse {
    pub session_id: SessionId,
    pub cancel_requested: bool,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InputRequest {
    #[serde(with = "crate::base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InputResponse {
    pub written: usize,
    /// The terminal had already closed; nothing was written.
    pub closed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EventsQuery {
    #[serde(default)]
    pub since_seq: u64,
    /// Comma-separated list of event types.
    #[serde(default)]
    pub types: Option<String>,
}

impl EventsQuery {
    pub fn type_filter(&self) -> Option<Vec<String>> {
        let types = self.types.as_deref()?;
        let list: Vec<String> = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        (!list.is_empty()).then_some(list)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default = "default_true")]
    pub include_terminal: bool,
}

impl Default for StreamQuery {
    fn default() -> Self {
        Self {
            since_seq: 0,
            include_terminal: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
    pub active: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Client-to-server messages on the bidirectional channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input {
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Cancel,
    Ping,
}

/// Replies to client control messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlReply {
    Pong { ts: DateTime<Utc> },
    Ack { op: String },
    Nack { op: String, error: String },
}

/// Server-to-client messages on the bidirectional channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Stream(MuxEvent),
    Control(ControlReply),
}

impl From<MuxEvent> for ServerMessage {
    fn from(event: MuxEvent) -> Self {
        ServerMessage::Stream(event)
    }
}

impl From<ControlReply> for ServerMessage {
    fn from(reply: ControlReply) -> Self {
        ServerMessage::Control(reply)
    }
}
