use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use taskmux_protocol::api::CommandDescriptor;
use taskmux_protocol::{SessionEvent, TaskState};

use crate::error::MuxError;
use crate::event_log::{EventLog, EventStore, LogSink};
use crate::pty::{OutputSink, PtyCommand, PtyEvent, PtyStreamService, Subscription, WriteOutcome};
use crate::registry::{ProcessRegistry, TerminateOutcome};
use crate::session::{Session, SessionManager, Task, TaskHandle};

/// How long to wait for the reader thread to report exit after termination.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Output refreshes the session's last activity at most this often.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock limit per task unless the request sets one.
    pub task_timeout: Option<Duration>,
    /// Fail a task that produces no output for this long.
    pub idle_timeout: Option<Duration>,
    pub default_rows: u16,
    pub default_cols: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Some(Duration::from_secs(3600)),
            idle_timeout: Some(Duration::from_secs(900)),
            default_rows: 24,
            default_cols: 80,
        }
    }
}

/// A request to run one task.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub command: CommandDescriptor,
    pub description: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub timeout: Option<Duration>,
}

/// Prepares the directory a task runs in.
pub trait WorkspaceProvider: Send + Sync {
    fn prepare(&self, session: &Session, task_id: &str) -> Result<PathBuf, MuxError>;
}

/// Runs tasks in the session's project path, or the service's cwd.
pub struct ProjectWorkspace;

impl WorkspaceProvider for ProjectWorkspace {
    fn prepare(&self, session: &Session, _task_id: &str) -> Result<PathBuf, MuxError> {
        match &session.project_path {
            Some(path) if path.is_dir() => Ok(path.clone()),
            Some(path) => Err(MuxError::InvalidInput(format!(
                "project path is not a directory: {}",
                path.display()
            ))),
            None => Ok(std::env::current_dir()?),
        }
    }
}

/// Turns a task request into the exact command to spawn.
pub trait CommandFactory: Send + Sync {
    fn build(&self, request: &TaskRequest, workdir: &Path) -> Result<PtyCommand, MuxError>;
}

/// Uses the request's descriptor as-is.
pub struct PassthroughCommand;

impl CommandFactory for PassthroughCommand {
    fn build(&self, request: &TaskRequest, workdir: &Path) -> Result<PtyCommand, MuxError> {
        let descriptor = &request.command;
        if descriptor.program.trim().is_empty() {
            return Err(MuxError::InvalidInput("command program is empty".to_string()));
        }
        let cwd = match &descriptor.cwd {
            Some(cwd) => workdir.join(cwd),
            None => workdir.to_path_buf(),
        };
        Ok(PtyCommand {
            program: descriptor.program.clone(),
            args: descriptor.args.clone(),
            env: descriptor
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cwd: Some(cwd),
            rows: request.rows.unwrap_or(24),
            cols: request.cols.unwrap_or(80),
        })
    }
}

/// Final disposition of a task.
#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    state: TaskState,
    reason: String,
    exit_code: Option<i32>,
}

impl Outcome {
    fn exited(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => Self {
                state: TaskState::Completed,
                reason: "completed".to_string(),
                exit_code,
            },
            Some(code) => Self::failed(format!("process exited with code {code}"), exit_code),
            None => Self::failed("process exited without a status", None),
        }
    }

    fn failed(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            state: TaskState::Failed,
            reason: reason.into(),
            exit_code,
        }
    }

    fn cancelled(exit_code: Option<i32>) -> Self {
        Self {
            state: TaskState::Cancelled,
            reason: "cancelled".to_string(),
            exit_code,
        }
    }
}

enum Stop {
    Cancelled,
    TimedOut(Duration),
    Idle(Duration),
    StreamFailed(String),
}

/// SIGKILLs the task's process if the driving future goes away before the
/// process was accounted for.
struct ProcessGuard {
    registry: Arc<ProcessRegistry>,
    pid: Option<u32>,
}

impl ProcessGuard {
    fn new(registry: Arc<ProcessRegistry>, pid: Option<u32>) -> Self {
        Self { registry, pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            if self.registry.contains(pid) {
                self.registry.kill_now(pid);
            }
        }
    }
}

/// Drives tasks from RUNNING to a terminal state and always writes the
/// closing entries.
#[derive(Clone)]
pub struct TaskExecutor {
    sessions: Arc<SessionManager>,
    store: Arc<EventStore>,
    pty: Arc<PtyStreamService>,
    registry: Arc<ProcessRegistry>,
    workspace: Arc<dyn WorkspaceProvider>,
    commands: Arc<dyn CommandFactory>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<EventStore>,
        pty: Arc<PtyStreamService>,
        config: ExecutorConfig,
    ) -> Self {
        let registry = Arc::clone(pty.registry());
        Self {
            sessions,
            store,
            pty,
            registry,
            workspace: Arc::new(ProjectWorkspace),
            commands: Arc::new(PassthroughCommand),
            config,
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandFactory>) -> Self {
        self.commands = commands;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Validate, move the task to RUNNING and hand it to a background driver.
    /// Busy sessions are rejected here, before anything is spawned.
    pub async fn start_task(&self, session_id: &str, request: TaskRequest) -> Result<Task, MuxError> {
        if request.command.program.trim().is_empty() {
            return Err(MuxError::InvalidInput("command program is empty".to_string()));
        }
        if request.rows == Some(0) || request.cols == Some(0) {
            return Err(MuxError::InvalidInput("terminal size must be non-zero".to_string()));
        }
        let handle = self
            .sessions
            .start_task(session_id, request.description.clone())
            .await?;
        let task = self
            .sessions
            .transition(&handle.task.id, TaskState::Running, None, None)
            .await?;

        let this = self.clone();
        tokio::spawn(async move { this.drive(handle, request).await });
        Ok(task)
    }

    async fn drive(self, handle: TaskHandle, request: TaskRequest) {
        let task_id = handle.task.id.clone();
        let session_id = handle.task.session_id.clone();

        // A panic inside the runner surfaces as a JoinError so the finalizer
        // below still runs.
        let runner = {
            let this = self.clone();
            tokio::spawn(async move { this.execute(handle, request).await })
        };
        let outcome = match runner.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "task runner crashed");
                Outcome::failed("executor crashed", None)
            }
        };
        self.finalize(&session_id, &task_id, outcome).await;
    }

    async fn execute(&self, handle: TaskHandle, request: TaskRequest) -> Outcome {
        let task_id = handle.task.id.as_str();
        let session_id = handle.task.session_id.as_str();

        let log = match self.store.open(session_id) {
            Ok(log) => log,
            Err(e) => return Outcome::failed(format!("log write failed: {e}"), None),
        };
        log.start_turn();
        if handle.cancel.is_cancelled() {
            return Outcome::cancelled(None);
        }

        let session = match self.sessions.get_session(session_id).await {
            Ok(session) => session,
            Err(e) => return Outcome::failed(e.to_string(), None),
        };
        let command = match self
            .workspace
            .prepare(&session, task_id)
            .and_then(|workdir| self.commands.build(&request, &workdir))
        {
            Ok(mut command) => {
                command.rows = request.rows.unwrap_or(self.config.default_rows);
                command.cols = request.cols.unwrap_or(self.config.default_cols);
                command
            }
            Err(e) => {
                record_error(&log, "setup", &e.to_string()).await;
                return Outcome::failed(format!("setup failed: {e}"), None);
            }
        };

        let started = log
            .append_async(SessionEvent::SessionStarted {
                task_id: task_id.to_string(),
                description: request.description.clone().map(Into::into),
                project_path: session.project_path.as_ref().map(|p| p.display().to_string()),
                command: command.argv(),
                cwd: command.cwd.as_ref().map(|p| p.display().to_string()),
            })
            .await;
        if let Err(e) = started {
            return Outcome::failed(format!("log write failed: {e}"), None);
        }

        let sink: Arc<dyn OutputSink> = Arc::new(LogSink::new(Arc::clone(&log)));
        let stream_id = match self.pty.start(session_id, command, Some(sink)) {
            Ok(stream_id) => stream_id,
            Err(e) => {
                warn!(task_id, session_id, error = %e, "task spawn failed");
                record_error(&log, "spawn", &e.to_string()).await;
                return Outcome::failed(e.to_string(), None);
            }
        };
        if let Err(e) = self.sessions.set_stream(task_id, &stream_id).await {
            warn!(task_id, error = %e, "failed to record stream id");
        }

        let mut guard = ProcessGuard::new(Arc::clone(&self.registry), self.pty.pid(&stream_id));
        let timeout = request.timeout.or(self.config.task_timeout);
        let outcome = self.monitor(&handle, &stream_id, &log, timeout).await;
        guard.disarm();
        outcome
    }

    async fn monitor(
        &self,
        handle: &TaskHandle,
        stream_id: &str,
        log: &Arc<EventLog>,
        timeout: Option<Duration>,
    ) -> Outcome {
        let mut events = match self.pty.subscribe(stream_id) {
            Ok(events) => events,
            Err(e) => {
                record_error(log, "stream", &e.to_string()).await;
                let exit_code = self.terminate(stream_id, None).await;
                return Outcome::failed(format!("stream error: {e}"), exit_code);
            }
        };

        let idle = self.config.idle_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut idle_deadline = idle.map(|t| Instant::now() + t);
        let mut last_touch = Instant::now();

        let stop = loop {
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => break Stop::Cancelled,
                _ = sleep_until(deadline) => break Stop::TimedOut(timeout.unwrap_or_default()),
                _ = sleep_until(idle_deadline) => break Stop::Idle(idle.unwrap_or_default()),
                event = events.recv() => match event {
                    Some(PtyEvent::Output { .. }) => {
                        idle_deadline = idle.map(|t| Instant::now() + t);
                        if last_touch.elapsed() >= ACTIVITY_INTERVAL {
                            last_touch = Instant::now();
                            self.sessions.touch(&handle.task.session_id).await;
                        }
                    }
                    Some(PtyEvent::Exit { exit_code }) => return Outcome::exited(exit_code),
                    Some(PtyEvent::Error { message }) => break Stop::StreamFailed(message),
                    None => return Outcome::exited(self.pty.exit_code(stream_id)),
                },
            }
        };

        match stop {
            Stop::Cancelled => {
                info!(task_id = %handle.task.id, stream_id, "cancelling task");
                let exit_code = self.terminate(stream_id, Some(&mut events)).await;
                Outcome::cancelled(exit_code)
            }
            Stop::TimedOut(limit) => {
                warn!(task_id = %handle.task.id, stream_id, limit_secs = limit.as_secs(), "task timed out");
                record_error(log, "timeout", &MuxError::TimeoutExceeded(limit).to_string()).await;
                let exit_code = self.terminate(stream_id, Some(&mut events)).await;
                Outcome::failed("timeout", exit_code)
            }
            Stop::Idle(limit) => {
                warn!(task_id = %handle.task.id, stream_id, limit_secs = limit.as_secs(), "task idle for too long");
                record_error(log, "timeout", &format!("no output for {limit:?}")).await;
                let exit_code = self.terminate(stream_id, Some(&mut events)).await;
                Outcome::failed("idle timeout", exit_code)
            }
            Stop::StreamFailed(message) => {
                error!(task_id = %handle.task.id, stream_id, error = %message, "task stream failed");
                record_error(log, "stream", &message).await;
                let exit_code = self.terminate(stream_id, Some(&mut events)).await;
                Outcome::failed(format!("stream error: {message}"), exit_code)
            }
        }
    }

    /// Escalate termination and wait for the reader thread to report exit.
    async fn terminate(&self, stream_id: &str, events: Option<&mut Subscription>) -> Option<i32> {
        match self.pty.cancel(stream_id).await {
            Ok(TerminateOutcome::Survived) => {
                error!(stream_id, "process survived termination");
            }
            Ok(_) => {}
            Err(e) => warn!(stream_id, error = %e, "terminate failed"),
        }
        let events = events?;
        let drained = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if let PtyEvent::Exit { exit_code } = event {
                    return exit_code;
                }
            }
            None
        })
        .await;
        drained.unwrap_or_else(|_| {
            warn!(stream_id, "no exit report after termination");
            None
        })
    }

    /// Always runs: snapshot, `session_ended`, release, state transition.
    async fn finalize(&self, session_id: &str, task_id: &str, mut outcome: Outcome) {
        let stream_id = self
            .sessions
            .get_task(task_id)
            .await
            .ok()
            .and_then(|task| task.stream_id);

        let log = self.store.open(session_id);
        if let Some(stream_id) = &stream_id {
            if let (Ok(log), Ok(snapshot)) = (&log, self.pty.snapshot(stream_id)) {
                let appended = log
                    .append_async(SessionEvent::TerminalOutput {
                        text: snapshot.text.into(),
                        rows: snapshot.rows,
                        cols: snapshot.cols,
                    })
                    .await;
                if let Err(e) = appended {
                    error!(task_id, error = %e, "failed to write terminal snapshot");
                }
            }
            if let Some(pid) = self.pty.pid(stream_id) {
                if self.registry.contains(pid)
                    && self.registry.terminate(pid).await == TerminateOutcome::Survived
                {
                    error!(task_id, pid, "process could not be killed during cleanup");
                }
            }
            self.pty.release(stream_id);
        }

        let ended = match log {
            Ok(log) => {
                let result = log
                    .append_async(SessionEvent::SessionEnded {
                        success: outcome.state == TaskState::Completed,
                        reason: outcome.reason.clone(),
                        exit_code: outcome.exit_code,
                    })
                    .await;
                log.end_turn();
                result
            }
            Err(e) => Err(e),
        };
        if let Err(e) = ended {
            error!(task_id, error = %e, "failed to write session_ended");
            if outcome.state == TaskState::Completed {
                outcome = Outcome::failed(format!("log write failed: {e}"), outcome.exit_code);
            }
        }

        match self
            .sessions
            .transition(task_id, outcome.state, Some(outcome.reason.clone()), outcome.exit_code)
            .await
        {
            Ok(_) => info!(
                task_id,
                session_id,
                state = %outcome.state,
                reason = %outcome.reason,
                "task finished"
            ),
            Err(e) => error!(task_id, error = %e, "failed to record final task state"),
        }
    }

    /// Forward input to the session's running terminal.
    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<WriteOutcome, MuxError> {
        let Some(stream_id) = self.stream_for(session_id).await? else {
            return Ok(WriteOutcome::TerminalClosed);
        };
        self.sessions.touch(session_id).await;
        match self.pty.write(&stream_id, data) {
            Err(MuxError::StreamNotFound(_)) => Ok(WriteOutcome::TerminalClosed),
            other => other,
        }
    }

    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), MuxError> {
        if rows == 0 || cols == 0 {
            return Err(MuxError::InvalidInput(format!(
                "terminal size must be non-zero, got {rows}x{cols}"
            )));
        }
        let stream_id = self.stream_for(session_id).await?.ok_or_else(|| {
            MuxError::Conflict(format!("session {session_id} has no running terminal"))
        })?;
        self.sessions.touch(session_id).await;
        self.pty.resize(&stream_id, rows, cols)
    }

    /// Returns the task that was signalled, if any.
    pub async fn cancel(&self, session_id: &str) -> Result<Option<Task>, MuxError> {
        self.sessions.request_cancel(session_id).await
    }

    /// With `force`, cancel and wait out any active task first.
    pub async fn delete_session(&self, session_id: &str, force: bool) -> Result<Session, MuxError> {
        if force {
            if let Some(task) = self.sessions.request_cancel(session_id).await? {
                let limit = self.registry.grace_period() + EXIT_DRAIN_TIMEOUT * 2;
                if tokio::time::timeout(limit, self.sessions.wait_for_terminal(&task.id))
                    .await
                    .is_err()
                {
                    return Err(MuxError::TimeoutExceeded(limit));
                }
            }
        }
        let session = self.sessions.delete_session(session_id).await?;
        self.store.forget(session_id);
        Ok(session)
    }

    /// Cancel every active task, wait for them, then sweep the registry.
    pub async fn shutdown(&self) {
        let active = self.sessions.active_sessions().await;
        let mut waiting = Vec::new();
        for session_id in &active {
            if let Ok(Some(task)) = self.sessions.request_cancel(session_id).await {
                waiting.push(task.id);
            }
        }
        if !waiting.is_empty() {
            info!(count = waiting.len(), "waiting for running tasks to stop");
            let limit = self.registry.grace_period() + EXIT_DRAIN_TIMEOUT * 2;
            let all = futures_util::future::join_all(
                waiting.iter().map(|id| self.sessions.wait_for_terminal(id)),
            );
            if tokio::time::timeout(limit, all).await.is_err() {
                warn!("tasks did not stop in time");
            }
        }
        let survivors = self.registry.terminate_all().await;
        if !survivors.is_empty() {
            error!(?survivors, "processes survived shutdown");
        }
    }

    async fn stream_for(&self, session_id: &str) -> Result<Option<String>, MuxError> {
        self.sessions.get_session(session_id).await?;
        let from_task = self
            .sessions
            .active_task(session_id)
            .await
            .and_then(|task| task.stream_id);
        Ok(from_task.or_else(|| self.pty.find_by_session(session_id)))
    }
}

async fn record_error(log: &Arc<EventLog>, kind: &str, message: &str) {
    let appended = log
        .append_async(SessionEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        })
        .await;
    if let Err(e) = appended {
        error!(session_id = log.session_id(), error = %e, "failed to log error event");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
