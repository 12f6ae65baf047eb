use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::info;

use libtaskmux::{MuxError, TaskRequest, WriteOutcome};
use taskmux_protocol::LogEntry;
use taskmux_protocol::api::{
    CancelResponse, CreateSessionRequest, EventsQuery, HealthResponse, InputRequest,
    InputResponse, ResizeRequest, SessionInfo, SessionList, StartTaskRequest, TaskInfo,
};

use crate::AppState;
use crate::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (sessions, active) = state.executor.sessions().counts().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions,
        active,
    })
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let project_path = req.project_path.map(PathBuf::from);
    if let Some(path) = &project_path {
        if !path.is_dir() {
            return Err(MuxError::InvalidInput(format!(
                "project path is not a directory: {}",
                path.display()
            ))
            .into());
        }
    }
    let session = state
        .executor
        .sessions()
        .create_session(project_path, req.name)
        .await;
    Ok((StatusCode::CREATED, Json(session.to_info())))
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionList> {
    let sessions: Vec<SessionInfo> = state
        .executor
        .sessions()
        .list_sessions()
        .await
        .iter()
        .map(|s| s.to_info())
        .collect();
    let total = sessions.len();
    Json(SessionList { sessions, total })
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let session = state.executor.sessions().get_session(&session_id).await?;
    Ok(Json(session.to_info()))
}

/// DELETE /api/sessions/{id}?force=bool
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state
        .executor
        .delete_session(&session_id, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/sessions/{id}/tasks
pub async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskInfo>)> {
    if state.shutdown.is_cancelled() {
        return Err(MuxError::Conflict("server is shutting down".to_string()).into());
    }
    let request = TaskRequest {
        command: req.command,
        description: req.description,
        rows: req.rows,
        cols: req.cols,
        timeout: req.timeout_secs.map(Duration::from_secs),
    };
    let task = state.executor.start_task(&session_id, request).await?;
    info!(session_id = %session_id, task_id = %task.id, "task accepted");
    Ok((StatusCode::CREATED, Json(task.to_info())))
}

/// GET /api/sessions/{id}/tasks/{task_id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path((session_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<TaskInfo>> {
    let task = state.executor.sessions().get_task(&task_id).await?;
    if task.session_id != session_id {
        return Err(MuxError::TaskNotFound(task_id).into());
    }
    Ok(Json(task.to_info()))
}

/// POST /api/sessions/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let response = match state.executor.cancel(&session_id).await? {
        Some(task) => CancelResponse {
            session_id,
            cancel_requested: true,
            message: format!("cancellation requested for task {}", task.id),
        },
        None => CancelResponse {
            session_id,
            cancel_requested: false,
            message: "no active task to cancel".to_string(),
        },
    };
    Ok(Json(response))
}

/// POST /api/sessions/{id}/input
pub async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<InputRequest>,
) -> ApiResult<Json<InputResponse>> {
    let response = match state.executor.send_input(&session_id, &req.data).await? {
        WriteOutcome::Written(written) => InputResponse {
            written,
            closed: false,
        },
        WriteOutcome::TerminalClosed => InputResponse {
            written: 0,
            closed: true,
        },
    };
    Ok(Json(response))
}

/// POST /api/sessions/{id}/resize
pub async fn resize(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Json<ResizeRequest>> {
    state
        .executor
        .resize(&session_id, req.rows, req.cols)
        .await?;
    Ok(Json(req))
}

/// GET /api/sessions/{id}/events?since_seq&types=a,b
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    ensure_known(&state, &session_id).await?;
    let types = query.type_filter();
    let entries = state
        .executor
        .store()
        .read_async(&session_id, query.since_seq, types)
        .await?;
    Ok(Json(entries))
}

/// A session is known if it is live or has a log left on disk.
pub(crate) async fn ensure_known(state: &AppState, session_id: &str) -> Result<(), MuxError> {
    if state.executor.sessions().get_session(session_id).await.is_ok()
        || state.executor.store().has_log(session_id)
    {
        Ok(())
    } else {
        Err(MuxError::SessionNotFound(session_id.to_string()))
    }
}
