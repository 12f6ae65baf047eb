use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use taskmux_protocol::MuxEvent;
use taskmux_protocol::api::StreamQuery;

use crate::AppState;
use crate::api::ensure_known;
use crate::error::ApiError;

/// GET /api/sessions/{id}/stream?since_seq&include_terminal
///
/// One SSE event per `MuxEvent`: `event:` is its kind and `id:` its sequence
/// number. Pings carry no id.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    ensure_known(&state, &session_id).await?;
    let events = state
        .mux
        .open(&session_id, query.since_seq, query.include_terminal)?;
    debug!(session_id = %session_id, since_seq = query.since_seq, "sse subscriber attached");

    // The multiplexer ends the stream itself, on shutdown included.
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(stream))
}

fn to_sse(event: &MuxEvent) -> Event {
    let mut sse = Event::default().event(event.kind());
    if let Some(seq) = event.seq() {
        sse = sse.id(seq.to_string());
    }
    match serde_json::to_string(event) {
        Ok(json) => sse.data(json),
        Err(e) => {
            warn!(error = %e, "failed to encode stream event");
            sse.data(r#"{"kind":"error","error":"encode failed","seq":0}"#)
        }
    }
}
