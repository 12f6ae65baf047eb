pub mod api;
pub mod config;
pub mod error;
pub mod sse;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use libtaskmux::{
    EventMultiplexer, EventStore, ProcessRegistry, PtyStreamService, SessionManager, TaskExecutor,
};

use crate::config::ServerConfig;

/// Everything a request handler can reach.
pub struct AppState {
    pub executor: TaskExecutor,
    pub mux: EventMultiplexer,
    /// Cancel to begin shutdown.
    pub shutdown: CancellationToken,
    /// Upgraded WebSocket connections, which outlive the HTTP server.
    pub sockets: TaskTracker,
}

impl AppState {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            EventStore::new(&config.log_dir, config.event_log()).with_context(|| {
                format!("failed to open log dir {}", config.log_dir.display())
            })?,
        );
        let registry = Arc::new(ProcessRegistry::with_pid_file(
            &config.pid_file,
            config.grace_period(),
        ));
        let pty = Arc::new(PtyStreamService::with_ring_bytes(
            registry,
            config.ring_buffer_bytes,
        ));
        let executor = TaskExecutor::new(
            Arc::new(SessionManager::new()),
            Arc::clone(&store),
            pty,
            config.executor(),
        );
        let mux = EventMultiplexer::new(store, config.ping_interval());
        Ok(Self {
            executor,
            mux,
            shutdown: CancellationToken::new(),
            sockets: TaskTracker::new(),
        })
    }
}

pub fn build_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route(
            "/api/sessions",
            post(api::create_session).get(api::list_sessions),
        )
        .route(
            "/api/sessions/{id}",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/api/sessions/{id}/tasks", post(api::start_task))
        .route("/api/sessions/{id}/tasks/{task_id}", get(api::get_task))
        .route("/api/sessions/{id}/cancel", post(api::cancel))
        .route("/api/sessions/{id}/input", post(api::send_input))
        .route("/api/sessions/{id}/resize", post(api::resize))
        .route("/api/sessions/{id}/events", get(api::events))
        .route("/api/sessions/{id}/stream", get(sse::stream))
        .route("/ws/{id}", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

/// Upper bound on waiting for WebSocket handlers to send their last frames.
const SOCKET_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve until `state.shutdown` is cancelled. Tasks are stopped first so that
/// their `session_ended` reaches subscribers; then every remaining stream is
/// closed with a final event before connections drain.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, cors: CorsLayer) -> Result<()> {
    let app = build_router(Arc::clone(&state), cors);
    let draining = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            draining.shutdown.cancelled().await;
            info!("shutdown requested, stopping tasks");
            draining.executor.shutdown().await;
            draining.mux.close();
        })
        .await?;

    state.sockets.close();
    if tokio::time::timeout(SOCKET_DRAIN_TIMEOUT, state.sockets.wait())
        .await
        .is_err()
    {
        warn!(open = state.sockets.len(), "websocket handlers still running at exit");
    }
    info!("listener closed");
    Ok(())
}
