use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::LogEntry;

/// One unit of the merged per-session stream delivered to observers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MuxEvent {
    Terminal {
        #[serde(with = "crate::base64_bytes")]
        data: Vec<u8>,
        seq: u64,
        has_ansi: bool,
    },
    Event(LogEntry),
    /// Keepalive. Never persisted.
    Ping { ts: DateTime<Utc> },
    /// The process has exited. `seq` is the last durable sequence number.
    Complete { exit_code: Option<i32>, seq: u64 },
    Error { error: String, seq: u64 },
}

impl MuxEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MuxEvent::Terminal { .. } => "terminal",
            MuxEvent::Event(_) => "event",
            MuxEvent::Ping { .. } => "ping",
            MuxEvent::Complete { .. } => "complete",
            MuxEvent::Error { .. } => "error",
        }
    }

    /// Sequence number a client can resume from, if the event carries one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            MuxEvent::Terminal { seq, .. }
            | MuxEvent::Complete { seq, .. }
            | MuxEvent::Error { seq, .. } => Some(*seq),
            MuxEvent::Event(entry) => Some(entry.seq),
            MuxEvent::Ping { .. } => None,
        }
    }

    /// True for the events after which the stream closes.
    pub fn is_final(&self) -> bool {
        matches!(self, MuxEvent::Complete { .. })
    }
}
