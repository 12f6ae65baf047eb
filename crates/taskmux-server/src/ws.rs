use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, warn};

use libtaskmux::{MuxError, WriteOutcome};
use taskmux_protocol::api::{ClientMessage, ControlReply, ServerMessage, StreamQuery};

use crate::AppState;
use crate::api::ensure_known;

/// Close code sent when the session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL: u16 = 1011;

/// GET /ws/{id}?since_seq&include_terminal
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let sockets = state.sockets.clone();
    ws.on_upgrade(move |socket| sockets.track_future(session_socket(socket, state, session_id, query)))
}

async fn session_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    query: StreamQuery,
) {
    if let Err(err) = session_socket_inner(socket, &state, &session_id, query).await {
        warn!(session_id = %session_id, "ws session closed with error: {err}");
    }
}

async fn session_socket_inner(
    mut socket: WebSocket,
    state: &AppState,
    session_id: &str,
    query: StreamQuery,
) -> Result<()> {
    if ensure_known(state, session_id).await.is_err() {
        close(&mut socket, CLOSE_SESSION_NOT_FOUND, "session not found").await?;
        return Ok(());
    }
    let mut events = match state
        .mux
        .open(session_id, query.since_seq, query.include_terminal)
    {
        Ok(events) => events,
        Err(e) => {
            close(&mut socket, CLOSE_INTERNAL, &e.public_message()).await?;
            return Ok(());
        }
    };
    debug!(session_id, since_seq = query.since_seq, "ws subscriber attached");

    let (mut ws_tx, mut ws_rx) = socket.split();
    // The multiplexer always yields a final `complete` or `error`, shutdown
    // included, before it ends.
    let close_code = || {
        if state.shutdown.is_cancelled() {
            CLOSE_GOING_AWAY
        } else {
            CLOSE_NORMAL
        }
    };
    loop {
        tokio::select! {
            maybe_event = events.next() => {
                let Some(event) = maybe_event else {
                    close(&mut ws_tx, close_code(), "stream ended").await?;
                    break;
                };
                let last = event.is_final();
                send(&mut ws_tx, &ServerMessage::from(event)).await?;
                if last {
                    close(&mut ws_tx, close_code(), "stream complete").await?;
                    break;
                }
            }
            maybe_msg = ws_rx.next() => {
                let Some(msg) = maybe_msg else {
                    break;
                };
                match msg? {
                    Message::Text(text) => {
                        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => handle_client_message(state, session_id, message).await,
                            Err(e) => ControlReply::Nack {
                                op: "parse".to_string(),
                                error: e.to_string(),
                            },
                        };
                        send(&mut ws_tx, &ServerMessage::from(reply)).await?;
                    }
                    Message::Binary(bytes) => {
                        let reply = handle_client_message(
                            state,
                            session_id,
                            ClientMessage::Input { data: bytes.to_vec() },
                        )
                        .await;
                        send(&mut ws_tx, &ServerMessage::from(reply)).await?;
                    }
                    Message::Close(_) => break,
                    Message::Ping(v) => ws_tx.send(Message::Pong(v)).await?,
                    Message::Pong(_) => {}
                }
            }
        }
    }
    debug!(session_id, "ws subscriber detached");
    Ok(())
}

async fn handle_client_message(
    state: &AppState,
    session_id: &str,
    message: ClientMessage,
) -> ControlReply {
    let (op, result) = match message {
        ClientMessage::Ping => return ControlReply::Pong { ts: Utc::now() },
        ClientMessage::Input { data } => (
            "input",
            match state.executor.send_input(session_id, &data).await {
                Ok(WriteOutcome::Written(_)) => Ok(()),
                Ok(WriteOutcome::TerminalClosed) => {
                    Err(MuxError::Stream("terminal closed".to_string()))
                }
                Err(e) => Err(e),
            },
        ),
        ClientMessage::Resize { rows, cols } => {
            ("resize", state.executor.resize(session_id, rows, cols).await)
        }
        ClientMessage::Cancel => (
            "cancel",
            state.executor.cancel(session_id).await.map(|_| ()),
        ),
    };
    match result {
        Ok(()) => ControlReply::Ack { op: op.to_string() },
        Err(e) => ControlReply::Nack {
            op: op.to_string(),
            error: e.public_message(),
        },
    }
}

async fn send<S>(ws_tx: &mut S, message: &ServerMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(message)?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn close<S>(ws_tx: &mut S, code: u16, reason: &str) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    ws_tx.send(Message::Close(Some(frame))).await?;
    Ok(())
}
