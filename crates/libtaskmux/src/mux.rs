use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures_util::Stream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskmux_protocol::{LogEntry, MuxEvent, SessionEvent};

use crate::error::MuxError;
use crate::event_log::{EventStore, LogCursor};

pub const DEFAULT_PING_INTERVAL: Duration =
    Duration::from_secs(taskmux_protocol::DEFAULT_PING_INTERVAL_SECS);

pub type MuxStream = Pin<Box<dyn Stream<Item = MuxEvent> + Send>>;

/// Final `error` message for streams ended by [`EventMultiplexer::close`].
pub const SHUTDOWN_MESSAGE: &str = "server shutting down";

enum Wake {
    Appended,
    Idle,
    Closed,
    Shutdown,
}

/// Turns a session's event log into one ordered, resumable stream per
/// subscriber. Terminal chunks are log entries too, so ordering is just the
/// log's sequence order.
#[derive(Clone)]
pub struct EventMultiplexer {
    store: Arc<EventStore>,
    ping_interval: Duration,
    shutdown: CancellationToken,
}

impl EventMultiplexer {
    pub fn new(store: Arc<EventStore>, ping_interval: Duration) -> Self {
        Self {
            store,
            ping_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// End every open stream, and any opened later. Each one drains what is
    /// already logged, then ends with `complete` if its task finished or with
    /// an `error` otherwise.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Replay entries after `since_seq`, then follow the log live. The stream
    /// always ends with `complete` or `error`.
    pub fn open(
        &self,
        session_id: &str,
        since_seq: u64,
        include_terminal: bool,
    ) -> Result<MuxStream, MuxError> {
        let log = self.store.open(session_id)?;
        let ping_interval = self.ping_interval;
        let session_id = session_id.to_string();

        let shutdown = self.shutdown.clone();

        Ok(Box::pin(stream! {
            // Subscribe before the first read so no append goes unnoticed.
            let mut appended = log.subscribe();
            let mut cursor = LogCursor::default();
            let mut watermark = since_seq;
            let mut ended: Option<Option<i32>> = None;
            let mut closing = false;
            let mut last_emit = Instant::now();

            loop {
                let (batch, next) = match log.read_new_async(cursor).await {
                    Ok(read) => read,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "event stream read failed");
                        yield MuxEvent::Error { error: e.to_string(), seq: watermark };
                        return;
                    }
                };
                let advanced = next != cursor;
                cursor = next;

                for entry in batch {
                    // Completion is judged on every entry, replayed or not.
                    ended = match &entry.event {
                        SessionEvent::SessionEnded { exit_code, .. } => Some(*exit_code),
                        _ => None,
                    };
                    if entry.seq <= since_seq {
                        continue;
                    }
                    watermark = entry.seq;
                    if let Some(event) = to_mux_event(entry, include_terminal) {
                        last_emit = Instant::now();
                        yield event;
                    }
                }

                // Keep reading until caught up with the file.
                if advanced {
                    continue;
                }

                if let Some(exit_code) = ended {
                    debug!(session_id = %session_id, seq = watermark, "event stream complete");
                    yield MuxEvent::Complete { exit_code, seq: watermark };
                    return;
                }
                if closing {
                    debug!(session_id = %session_id, seq = watermark, "event stream closed for shutdown");
                    yield MuxEvent::Error { error: SHUTDOWN_MESSAGE.to_string(), seq: watermark };
                    return;
                }

                let wake = tokio::select! {
                    _ = shutdown.cancelled() => Wake::Shutdown,
                    changed = appended.changed() => {
                        if changed.is_ok() { Wake::Appended } else { Wake::Closed }
                    }
                    _ = tokio::time::sleep_until(last_emit + ping_interval) => Wake::Idle,
                };
                match wake {
                    Wake::Appended => {}
                    // One more read picks up anything logged before the close.
                    Wake::Shutdown => closing = true,
                    Wake::Idle => {
                        last_emit = Instant::now();
                        yield MuxEvent::Ping { ts: Utc::now() };
                    }
                    Wake::Closed => {
                        yield MuxEvent::Error {
                            error: "event log closed".to_string(),
                            seq: watermark,
                        };
                        return;
                    }
                }
            }
        }))
    }
}

fn to_mux_event(entry: LogEntry, include_terminal: bool) -> Option<MuxEvent> {
    match entry.event {
        SessionEvent::TerminalChunk { data, has_ansi } => {
            include_terminal.then_some(MuxEvent::Terminal {
                data,
                seq: entry.seq,
                has_ansi,
            })
        }
        SessionEvent::Error { message, .. } => Some(MuxEvent::Error {
            error: message,
            seq: entry.seq,
        }),
        _ => Some(MuxEvent::Event(entry)),
    }
}
