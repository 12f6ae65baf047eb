use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskmux_protocol::api::{SessionInfo, TaskInfo};
use taskmux_protocol::{SessionId, TaskId, TaskState};

use crate::error::MuxError;

const DEFAULT_SESSION_NAME: &str = "New Session";

/// A user's logical workspace.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub project_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub active_task: Option<TaskId>,
    pub task_ids: Vec<TaskId>,
}

impl Session {
    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            project_path: self
                .project_path
                .as_ref()
                .map(|p| p.display().to_string()),
            created_at: self.created_at,
            last_activity: self.last_activity,
            active_task_id: self.active_task.clone(),
            task_count: self.task_ids.len(),
        }
    }
}

/// One execution of an agent against a session.
#[derive(Debug, Clone)]
pub struct Task {
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

impl Task {
    pub fn to_info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            reason: self.reason.clone(),
            exit_code: self.exit_code,
            stream_id: self.stream_id.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancel_requested: self.cancel_requested,
        }
    }
}

/// What the executor needs to drive a freshly created task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task: Task,
    pub cancel: CancellationToken,
}

struct TaskRecord {
    task: Task,
    cancel: CancellationToken,
    state_tx: watch::Sender<TaskState>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    tasks: HashMap<TaskId, TaskRecord>,
}

impl Registry {
    fn active_task(&self, session_id: &str) -> Option<&TaskRecord> {
        let task_id = self.sessions.get(session_id)?.active_task.as_ref()?;
        self.tasks
            .get(task_id)
            .filter(|record| !record.task.state.is_terminal())
    }
}

/// Sessions and the task state machine. The lock covers map updates only.
pub struct SessionManager {
    inner: RwLock<Registry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    pub async fn create_session(
        &self,
        project_path: Option<PathBuf>,
        name: Option<String>,
    ) -> Session {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let id = loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !inner.sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Session {
            id: id.clone(),
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
            project_path,
            created_at: now,
            last_activity: now,
            active_task: None,
            task_ids: Vec::new(),
        };
        inner.sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, "session created");
        session
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, MuxError> {
        self.inner
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| MuxError::SessionNotFound(session_id.to_string()))
    }

    /// Newest first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> =
            self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Fails with `Conflict` while the session has a non-terminal task.
    pub async fn delete_session(&self, session_id: &str) -> Result<Session, MuxError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(MuxError::SessionNotFound(session_id.to_string()));
        }
        if let Some(record) = inner.active_task(session_id) {
            return Err(MuxError::Conflict(format!(
                "session {session_id} has an active task {}",
                record.task.id
            )));
        }
        let session = inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| MuxError::SessionNotFound(session_id.to_string()))?;
        for task_id in &session.task_ids {
            inner.tasks.remove(task_id);
        }
        info!(session_id, "session deleted");
        Ok(session)
    }

    /// Create a PENDING task. Fails with `Conflict` if the session is busy.
    pub async fn start_task(
        &self,
        session_id: &str,
        description: Option<String>,
    ) -> Result<TaskHandle, MuxError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(MuxError::SessionNotFound(session_id.to_string()));
        }
        if let Some(record) = inner.active_task(session_id) {
            return Err(MuxError::Conflict(format!(
                "session {session_id} already has a {} task {}",
                record.task.state, record.task.id
            )));
        }

        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            state: TaskState::Pending,
            reason: None,
            exit_code: None,
            stream_id: None,
            description,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancel_requested: false,
        };
        let cancel = CancellationToken::new();
        let (state_tx, _) = watch::channel(TaskState::Pending);
        inner.tasks.insert(
            task.id.clone(),
            TaskRecord {
                task: task.clone(),
                cancel: cancel.clone(),
                state_tx,
            },
        );
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.active_task = Some(task.id.clone());
            session.task_ids.push(task.id.clone());
            session.last_activity = now;
        }
        debug!(session_id, task_id = %task.id, "task created");
        Ok(TaskHandle { task, cancel })
    }

    /// Move a task along the state machine. Terminal states free the session.
    pub async fn transition(
        &self,
        task_id: &str,
        next: TaskState,
        reason: Option<String>,
        exit_code: Option<i32>,
    ) -> Result<Task, MuxError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MuxError::TaskNotFound(task_id.to_string()))?;
        let current = record.task.state;
        if !current.can_transition_to(next) {
            return Err(MuxError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let now = Utc::now();
        record.task.state = next;
        if next == TaskState::Running {
            record.task.started_at = Some(now);
        }
        if next.is_terminal() {
            record.task.completed_at = Some(now);
            record.task.reason = reason;
            record.task.exit_code = exit_code;
        }
        record.state_tx.send_replace(next);
        let task = record.task.clone();

        if let Some(session) = inner.sessions.get_mut(&task.session_id) {
            session.last_activity = now;
            if next.is_terminal() && session.active_task.as_deref() == Some(task_id) {
                session.active_task = None;
            }
        }
        info!(task_id, session_id = %task.session_id, from = %current, to = %next, "task state changed");
        Ok(task)
    }

    /// Signal the session's active task to stop. Idempotent; returns the task
    /// that was signalled, or `None` if there was nothing to cancel.
    pub async fn request_cancel(&self, session_id: &str) -> Result<Option<Task>, MuxError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(MuxError::SessionNotFound(session_id.to_string()));
        }
        let Some(task_id) = inner.active_task(session_id).map(|r| r.task.id.clone()) else {
            return Ok(None);
        };
        let Some(record) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !record.task.cancel_requested {
            info!(session_id, task_id = %task_id, "cancel requested");
        }
        record.task.cancel_requested = true;
        record.cancel.cancel();
        Ok(Some(record.task.clone()))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, MuxError> {
        self.inner
            .read()
            .await
            .tasks
            .get(task_id)
            .map(|r| r.task.clone())
            .ok_or_else(|| MuxError::TaskNotFound(task_id.to_string()))
    }

    /// The session's non-terminal task, if any.
    pub async fn active_task(&self, session_id: &str) -> Option<Task> {
        self.inner
            .read()
            .await
            .active_task(session_id)
            .map(|r| r.task.clone())
    }

    /// Oldest first.
    pub async fn tasks_for_session(&self, session_id: &str) -> Result<Vec<Task>, MuxError> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| MuxError::SessionNotFound(session_id.to_string()))?;
        Ok(session
            .task_ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).map(|r| r.task.clone()))
            .collect())
    }

    pub async fn set_stream(&self, task_id: &str, stream_id: &str) -> Result<(), MuxError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MuxError::TaskNotFound(task_id.to_string()))?;
        record.task.stream_id = Some(stream_id.to_string());
        Ok(())
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.inner.write().await.sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Resolves once the task reaches a terminal state.
    pub async fn wait_for_terminal(&self, task_id: &str) -> Result<Task, MuxError> {
        let mut rx = {
            let inner = self.inner.read().await;
            inner
                .tasks
                .get(task_id)
                .map(|r| r.state_tx.subscribe())
                .ok_or_else(|| MuxError::TaskNotFound(task_id.to_string()))?
        };
        // The sender lives in the record; an error means the task was removed.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.get_task(task_id).await
    }

    /// Ids of sessions that currently have a non-terminal task.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .keys()
            .filter(|id| inner.active_task(id).is_some())
            .cloned()
            .collect()
    }

    /// `(sessions, sessions with an active task)`.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let active = inner
            .sessions
            .keys()
            .filter(|id| inner.active_task(id).is_some())
            .count();
        (inner.sessions.len(), active)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn create_get_list_sessions() {
        let mgr = SessionManager::new();
        let first = mgr.create_session(Some(PathBuf::from("/tmp/p")), None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = mgr
            .create_session(None, Some("refactor".to_string()))
            .await;

        assert_eq!(first.id.len(), 8);
        assert_eq!(first.name, "New Session");
        assert_eq!(mgr.get_session(&second.id).await.unwrap().name, "refactor");

        let listed: Vec<SessionId> = mgr.list_sessions().await.into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second.id.clone(), first.id.clone()]);
        assert!(matches!(
            mgr.get_session("missing").await,
            Err(MuxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_task_on_busy_session_conflicts() {
        let mgr = SessionManager::new();
        let session = mgr.create_session(None, None).await;
        let handle = mgr.start_task(&session.id, None).await.unwrap();
        assert_eq!(handle.task.state, TaskState::Pending);

        let err = mgr.start_task(&session.id, None).await.unwrap_err();
        assert!(matches!(err, MuxError::Conflict(_)));
        assert_eq!(mgr.tasks_for_session(&session.id).await.unwrap().len(), 1);

        mgr.transition(&handle.task.id, TaskState::Running, None, None)
            .await
            .unwrap();
        mgr.transition(
            &handle.task.id,
            TaskState::Completed,
            Some("completed".into()),
            Some(0),
        )
        .await
        .unwrap();

        assert!(mgr.active_task(&session.id).await.is_none());
        mgr.start_task(&session.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let mgr = SessionManager::new();
        let session = mgr.create_session(None, None).await;
        let task = mgr.start_task(&session.id, None).await.unwrap().task;

        let running = mgr
            .transition(&task.id, TaskState::Running, None, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let failed = mgr
            .transition(&task.id, TaskState::Failed, Some("timeout".into()), None)
            .await
            .unwrap();
        assert_eq!(failed.reason.as_deref(), Some("timeout"));
        assert!(failed.completed_at.is_some());

        for next in [TaskState::Running, TaskState::Cancelled, TaskState::Completed] {
            assert!(matches!(
                mgr.transition(&task.id, next, None, None).await,
                Err(MuxError::InvalidTransition { .. })
            ));
        }
        assert_eq!(mgr.get_task(&task.id).await.unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn request_cancel_is_idempotent() {
        let mgr = SessionManager::new();
        let session = mgr.create_session(None, None).await;
        let handle = mgr.start_task(&session.id, None).await.unwrap();

        let first = mgr.request_cancel(&session.id).await.unwrap().unwrap();
        let second = mgr.request_cancel(&session.id).await.unwrap().unwrap();
        assert!(first.cancel_requested && second.cancel_requested);
        assert!(handle.cancel.is_cancelled());

        mgr.transition(&handle.task.id, TaskState::Cancelled, Some("cancelled".into()), None)
            .await
            .unwrap();
        assert!(mgr.request_cancel(&session.id).await.unwrap().is_none());
        assert_eq!(
            mgr.get_task(&handle.task.id).await.unwrap().state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn delete_requires_idle_session() {
        let mgr = SessionManager::new();
        let session = mgr.create_session(None, None).await;
        let task = mgr.start_task(&session.id, None).await.unwrap().task;

        assert!(matches!(
            mgr.delete_session(&session.id).await,
            Err(MuxError::Conflict(_))
        ));

        mgr.transition(&task.id, TaskState::Cancelled, None, None)
            .await
            .unwrap();
        mgr.delete_session(&session.id).await.unwrap();
        assert!(mgr.get_session(&session.id).await.is_err());
        assert!(mgr.get_task(&task.id).await.is_err());
    }

    #[tokio::test]
    async fn wait_for_terminal_resolves_on_transition() {
        let mgr = Arc::new(SessionManager::new());
        let session = mgr.create_session(None, None).await;
        let task = mgr.start_task(&session.id, None).await.unwrap().task;

        let waiter = {
            let mgr = Arc::clone(&mgr);
            let task_id = task.id.clone();
            tokio::spawn(async move { mgr.wait_for_terminal(&task_id).await })
        };
        mgr.transition(&task.id, TaskState::Running, None, None)
            .await
            .unwrap();
        mgr.transition(&task.id, TaskState::Completed, None, Some(0))
            .await
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(mgr.counts().await, (1, 0));
    }
}
