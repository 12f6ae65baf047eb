use std::time::Duration;

use taskmux_protocol::{SessionId, TaskId, TaskState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout exceeded after {0:?}")]
    TimeoutExceeded(Duration),

    #[error("log write failed: {0}")]
    LogWrite(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MuxError {
    /// Stable snake_case code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            MuxError::Spawn(_) => "spawn_error",
            MuxError::Stream(_) => "stream_error",
            MuxError::Conflict(_) => "conflict",
            MuxError::TimeoutExceeded(_) => "timeout_exceeded",
            MuxError::LogWrite(_) => "log_write_error",
            MuxError::SessionNotFound(_) => "session_not_found",
            MuxError::TaskNotFound(_) => "task_not_found",
            MuxError::StreamNotFound(_) => "stream_not_found",
            MuxError::InvalidTransition { .. } => "invalid_transition",
            MuxError::InvalidInput(_) => "invalid_input",
            MuxError::Io(_) => "io_error",
            MuxError::Json(_) => "json_error",
        }
    }

    /// Message safe to hand to clients.
    pub fn public_message(&self) -> String {
        match self {
            MuxError::Io(_) => "internal I/O error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MuxError::SessionNotFound(_) | MuxError::TaskNotFound(_) | MuxError::StreamNotFound(_)
        )
    }
}
