use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use taskmux_protocol::SessionId;

use crate::error::MuxError;
use crate::output::{self, CURSOR_POSITION_REPLY, DEFAULT_RING_BYTES, RingBuffer};
use crate::registry::{self, ProcessRegistry, TerminateOutcome};

const READ_CHUNK: usize = 4096;

/// What to run inside the pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            rows: 24,
            cols: 80,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Delivered to every subscriber of a stream, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    Output {
        seq: u64,
        data: Vec<u8>,
        has_ansi: bool,
    },
    Exit {
        exit_code: Option<i32>,
    },
    Error {
        message: String,
    },
}

/// Durable recorder for raw output. Called on the reader thread before the
/// chunk is fanned out; returns the sequence number assigned to the chunk.
pub trait OutputSink: Send + Sync {
    fn record_output(&self, data: &[u8], has_ansi: bool) -> Result<u64, MuxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// The terminal had already closed. Not an error.
    TerminalClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSnapshot {
    pub text: String,
    pub rows: u16,
    pub cols: u16,
}

/// Receiving side of a stream subscription.
pub struct Subscription {
    pub stream_id: String,
    rx: mpsc::UnboundedReceiver<PtyEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PtyEvent> {
        self.rx.recv().await
    }
}

struct StreamState {
    ring: RingBuffer,
    subscribers: Vec<mpsc::UnboundedSender<PtyEvent>>,
    screen: vt100::Parser,
    exited: bool,
    exit_code: Option<i32>,
}

/// One live pseudo-terminal bound to a child process.
pub struct PtyStream {
    pub stream_id: String,
    pub session_id: SessionId,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    state: Mutex<StreamState>,
    local_seq: AtomicU64,
}

impl PtyStream {
    pub fn is_exited(&self) -> bool {
        self.lock_state().exited
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the buffer under the lock, then fan out to a copy of the
    /// subscriber list with the lock released.
    fn publish(&self, event: PtyEvent) {
        let subscribers = {
            let mut state = self.lock_state();
            match &event {
                PtyEvent::Output {
                    seq,
                    data,
                    has_ansi,
                } => {
                    state.ring.push(*seq, data.clone(), *has_ansi);
                    state.screen.process(data);
                }
                PtyEvent::Exit { exit_code } => {
                    state.exited = true;
                    state.exit_code = *exit_code;
                }
                PtyEvent::Error { .. } => {}
            }
            state.subscribers.retain(|tx| !tx.is_closed());
            let subscribers = state.subscribers.clone();
            if matches!(event, PtyEvent::Exit { .. }) {
                state.subscribers.clear();
            }
            subscribers
        };
        for tx in subscribers {
            let _ = tx.send(event.clone());
        }
    }

    fn answer_cursor_requests(&self, data: &[u8]) -> Vec<u8> {
        let (clean, found) = output::strip_cursor_requests(data);
        if found > 0 {
            let mut writer = self.lock_writer();
            if let Some(w) = writer.as_mut() {
                for _ in 0..found {
                    if let Err(e) = w.write_all(CURSOR_POSITION_REPLY).and_then(|_| w.flush()) {
                        debug!(stream_id = %self.stream_id, error = %e, "cursor reply failed");
                        break;
                    }
                }
            }
        }
        clean
    }

    fn next_local_seq(&self) -> u64 {
        self.local_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Owns every pseudo-terminal in the process.
pub struct PtyStreamService {
    streams: RwLock<HashMap<String, Arc<PtyStream>>>,
    registry: Arc<ProcessRegistry>,
    ring_bytes: usize,
}

impl PtyStreamService {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self::with_ring_bytes(registry, DEFAULT_RING_BYTES)
    }

    pub fn with_ring_bytes(registry: Arc<ProcessRegistry>, ring_bytes: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            registry,
            ring_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Spawn `command` on a fresh PTY and start its reader thread.
    pub fn start(
        &self,
        session_id: &str,
        command: PtyCommand,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> Result<String, MuxError> {
        let program = resolve_program(&command.program, command.cwd.as_deref())?;
        let size = PtySize {
            rows: command.rows.max(1),
            cols: command.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| MuxError::Spawn(format!("failed to allocate pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("LINES", size.rows.to_string());
        cmd.env("COLUMNS", size.cols.to_string());
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::Spawn(format!("{}: {e}", command.program)))?;
        // The parent only talks through the master side.
        drop(pair.slave);

        let Some(pid) = child.process_id() else {
            let _ = child.kill();
            return Err(MuxError::Spawn("child has no pid".to_string()));
        };

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::Spawn(format!("failed to clone pty reader: {e}")));
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::Spawn(format!("failed to take pty writer: {e}")));
        let (reader, writer) = match (reader, writer) {
            (Ok(reader), Ok(writer)) => (reader, writer),
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let stream_id = new_stream_id();
        self.registry.register(pid, &stream_id);

        let stream = Arc::new(PtyStream {
            stream_id: stream_id.clone(),
            session_id: session_id.to_string(),
            pid,
            created_at: Utc::now(),
            master: Mutex::new(pair.master),
            writer: Mutex::new(Some(writer)),
            state: Mutex::new(StreamState {
                ring: RingBuffer::new(self.ring_bytes),
                subscribers: Vec::new(),
                screen: vt100::Parser::new(size.rows, size.cols, 0),
                exited: false,
                exit_code: None,
            }),
            local_seq: AtomicU64::new(0),
        });

        self.write_streams().insert(stream_id.clone(), Arc::clone(&stream));

        let registry = Arc::clone(&self.registry);
        let thread_stream = Arc::clone(&stream);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-{stream_id}"))
            .spawn(move || read_loop(thread_stream, reader, child, sink, registry));
        if let Err(e) = spawned {
            // The closure (and the child handle in it) is gone; kill by pid.
            self.write_streams().remove(&stream_id);
            self.registry.kill_now(pid);
            return Err(MuxError::Spawn(format!("failed to start reader thread: {e}")));
        }

        info!(stream_id = %stream_id, session_id, pid, program = %command.program, "pty spawned");
        Ok(stream_id)
    }

    /// Replay of the ring buffer followed by every future event. A stream that
    /// has already exited replays and then yields `Exit`.
    pub fn subscribe(&self, stream_id: &str) -> Result<Subscription, MuxError> {
        let stream = self.get(stream_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = stream.lock_state();
            for chunk in state.ring.replay_from(None) {
                let _ = tx.send(PtyEvent::Output {
                    seq: chunk.seq,
                    data: chunk.data,
                    has_ansi: chunk.has_ansi,
                });
            }
            if state.exited {
                let _ = tx.send(PtyEvent::Exit {
                    exit_code: state.exit_code,
                });
            } else {
                state.subscribers.push(tx);
            }
        }
        Ok(Subscription {
            stream_id: stream_id.to_string(),
            rx,
        })
    }

    /// Forward bytes to the terminal's input side.
    pub fn write(&self, stream_id: &str, data: &[u8]) -> Result<WriteOutcome, MuxError> {
        let stream = self.get(stream_id)?;
        if stream.is_exited() {
            return Ok(WriteOutcome::TerminalClosed);
        }
        let result = {
            let mut writer = stream.lock_writer();
            let Some(w) = writer.as_mut() else {
                return Ok(WriteOutcome::TerminalClosed);
            };
            w.write_all(data).and_then(|_| w.flush())
        };
        match result {
            Ok(()) => Ok(WriteOutcome::Written(data.len())),
            Err(_) if stream.is_exited() || !registry::is_alive(stream.pid) => {
                Ok(WriteOutcome::TerminalClosed)
            }
            Err(e) => {
                let message = format!("write to terminal failed: {e}");
                error!(stream_id, error = %e, "pty write failed");
                stream.publish(PtyEvent::Error {
                    message: message.clone(),
                });
                Err(MuxError::Stream(message))
            }
        }
    }

    pub fn resize(&self, stream_id: &str, rows: u16, cols: u16) -> Result<(), MuxError> {
        if rows == 0 || cols == 0 {
            return Err(MuxError::InvalidInput(format!(
                "terminal size must be non-zero, got {rows}x{cols}"
            )));
        }
        let stream = self.get(stream_id)?;
        stream
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Stream(format!("resize failed: {e}")))?;
        stream.lock_state().screen.screen_mut().set_size(rows, cols);
        debug!(stream_id, rows, cols, "pty resized");
        Ok(())
    }

    /// Run the SIGTERM/SIGKILL escalation for the stream's process.
    pub async fn cancel(&self, stream_id: &str) -> Result<TerminateOutcome, MuxError> {
        let pid = self.get(stream_id)?.pid;
        Ok(self.registry.terminate(pid).await)
    }

    /// Rendered contents of the terminal screen.
    pub fn snapshot(&self, stream_id: &str) -> Result<ScreenSnapshot, MuxError> {
        let stream = self.get(stream_id)?;
        let state = stream.lock_state();
        let screen = state.screen.screen();
        let (rows, cols) = screen.size();
        Ok(ScreenSnapshot {
            text: screen.contents(),
            rows,
            cols,
        })
    }

    pub fn pid(&self, stream_id: &str) -> Option<u32> {
        self.get(stream_id).ok().map(|s| s.pid)
    }

    pub fn exit_code(&self, stream_id: &str) -> Option<i32> {
        self.get(stream_id).ok().and_then(|s| s.exit_code())
    }

    pub fn is_exited(&self, stream_id: &str) -> bool {
        self.get(stream_id).map(|s| s.is_exited()).unwrap_or(true)
    }

    /// Most recent live stream of a session, else its most recent one.
    pub fn find_by_session(&self, session_id: &str) -> Option<String> {
        let streams = self.read_streams();
        let mut candidates: Vec<&Arc<PtyStream>> = streams
            .values()
            .filter(|s| s.session_id == session_id)
            .collect();
        candidates.sort_by_key(|s| (!s.is_exited(), s.created_at));
        candidates.last().map(|s| s.stream_id.clone())
    }

    /// Drop the service's handle on a stream, killing its process if it is
    /// still running. Subscribers keep draining what they already received.
    pub fn release(&self, stream_id: &str) -> bool {
        let removed = self.write_streams().remove(stream_id);
        if let Some(stream) = &removed {
            if !stream.is_exited() && self.registry.contains(stream.pid) {
                warn!(stream_id, pid = stream.pid, "releasing a stream that has not exited");
                self.registry.kill_now(stream.pid);
            }
            debug!(stream_id, "pty released");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.read_streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, stream_id: &str) -> Result<Arc<PtyStream>, MuxError> {
        self.read_streams()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| MuxError::StreamNotFound(stream_id.to_string()))
    }

    fn read_streams(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PtyStream>>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_streams(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PtyStream>>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn replace_writer(&self, stream_id: &str, writer: Box<dyn Write + Send>) {
        if let Ok(stream) = self.get(stream_id) {
            *stream.lock_writer() = Some(writer);
        }
    }
}

/// Sole owner of the PTY reader and the child handle.
fn read_loop(
    stream: Arc<PtyStream>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send>,
    sink: Option<Arc<dyn OutputSink>>,
    registry: Arc<ProcessRegistry>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = stream.answer_cursor_requests(&buf[..n]);
                if data.is_empty() {
                    continue;
                }
                let has_ansi = output::has_ansi(&data);
                let seq = match &sink {
                    Some(sink) => match sink.record_output(&data, has_ansi) {
                        Ok(seq) => seq,
                        Err(e) => {
                            error!(stream_id = %stream.stream_id, error = %e, "failed to record pty output");
                            stream.publish(PtyEvent::Error {
                                message: e.to_string(),
                            });
                            break;
                        }
                    },
                    None => stream.next_local_seq(),
                };
                stream.publish(PtyEvent::Output {
                    seq,
                    data,
                    has_ansi,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side closes.
            Err(e) => {
                debug!(stream_id = %stream.stream_id, error = %e, "pty read ended");
                break;
            }
        }
    }

    let exit_code = match child.wait() {
        Ok(status) => i32::try_from(status.exit_code()).ok(),
        Err(e) => {
            warn!(stream_id = %stream.stream_id, error = %e, "failed to collect exit status");
            None
        }
    };
    *stream.lock_writer() = None;
    // Reaped above, so the pid is confirmed gone before anyone hears of it.
    registry.deregister(stream.pid);
    stream.publish(PtyEvent::Exit { exit_code });
    info!(stream_id = %stream.stream_id, pid = stream.pid, exit_code = ?exit_code, "pty exited");
}

fn new_stream_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("pty_{}", &id[..8])
}

/// Fail fast with a spawn error when the executable does not exist.
fn resolve_program(program: &str, cwd: Option<&Path>) -> Result<String, MuxError> {
    if program.trim().is_empty() {
        return Err(MuxError::Spawn("empty program".to_string()));
    }
    if program.contains('/') {
        let path = match cwd {
            Some(cwd) if Path::new(program).is_relative() => cwd.join(program),
            _ => PathBuf::from(program),
        };
        if path.is_file() {
            return Ok(program.to_string());
        }
        return Err(MuxError::Spawn(format!("executable not found: {program}")));
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    if std::env::split_paths(&search).any(|dir| dir.join(program).is_file()) {
        Ok(program.to_string())
    } else {
        Err(MuxError::Spawn(format!("executable not found in PATH: {program}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service() -> PtyStreamService {
        PtyStreamService::new(Arc::new(ProcessRegistry::new(Duration::from_secs(2))))
    }

    fn sh(script: &str) -> PtyCommand {
        PtyCommand::new("sh").args(["-c", script])
    }

    async fn collect_until_exit(sub: &mut Subscription) -> (Vec<u8>, Option<i32>) {
        let mut output = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), sub.recv())
                .await
                .expect("timed out waiting for pty")
                .expect("subscription closed before exit");
            match event {
                PtyEvent::Output { data, .. } => output.extend(data),
                PtyEvent::Exit { exit_code } => return (output, exit_code),
                PtyEvent::Error { message } => panic!("unexpected error: {message}"),
            }
        }
    }

    #[tokio::test]
    async fn echo_output_and_exit_code() {
        let svc = service();
        let id = svc.start("s1", sh("printf hello; exit 3"), None).unwrap();
        let mut sub = svc.subscribe(&id).unwrap();

        let (output, exit_code) = collect_until_exit(&mut sub).await;
        assert!(String::from_utf8_lossy(&output).contains("hello"));
        assert_eq!(exit_code, Some(3));
        assert!(svc.is_exited(&id));
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_then_exit() {
        let svc = service();
        let id = svc.start("s1", sh("echo replayed"), None).unwrap();
        let mut first = svc.subscribe(&id).unwrap();
        let _ = collect_until_exit(&mut first).await;

        let mut late = svc.subscribe(&id).unwrap();
        let (output, exit_code) = collect_until_exit(&mut late).await;
        assert!(String::from_utf8_lossy(&output).contains("replayed"));
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn write_reaches_the_process() {
        let svc = service();
        let id = svc.start("s1", sh("read line; echo got:$line"), None).unwrap();
        let mut sub = svc.subscribe(&id).unwrap();

        let outcome = svc.write(&id, b"ping\n").unwrap();
        assert_eq!(outcome, WriteOutcome::Written(5));

        let (output, exit_code) = collect_until_exit(&mut sub).await;
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
        assert_eq!(exit_code, Some(0));

        assert_eq!(svc.write(&id, b"late").unwrap(), WriteOutcome::TerminalClosed);
    }

    #[tokio::test]
    async fn snapshot_renders_screen() {
        let svc = service();
        let id = svc
            .start("s1", sh("printf 'line one\\nline two\\n'").size(10, 40), None)
            .unwrap();
        let mut sub = svc.subscribe(&id).unwrap();
        let _ = collect_until_exit(&mut sub).await;

        let snap = svc.snapshot(&id).unwrap();
        assert_eq!((snap.rows, snap.cols), (10, 40));
        assert!(snap.text.contains("line one"));
        assert!(snap.text.contains("line two"));
    }

    #[tokio::test]
    async fn cancel_terminates_long_running_process() {
        let svc = service();
        let id = svc.start("s1", sh("sleep 30"), None).unwrap();
        let mut sub = svc.subscribe(&id).unwrap();
        let pid = svc.pid(&id).unwrap();
        assert!(svc.registry().contains(pid));

        let outcome = svc.cancel(&id).await.unwrap();
        assert!(matches!(
            outcome,
            TerminateOutcome::Graceful | TerminateOutcome::Killed
        ));
        let (_, _) = collect_until_exit(&mut sub).await;
        assert!(!svc.registry().contains(pid));
    }

    #[tokio::test]
    async fn resize_updates_snapshot_size() {
        let svc = service();
        let id = svc.start("s1", sh("sleep 5"), None).unwrap();
        svc.resize(&id, 40, 120).unwrap();
        let snap = svc.snapshot(&id).unwrap();
        assert_eq!((snap.rows, snap.cols), (40, 120));
        assert!(matches!(
            svc.resize(&id, 0, 10),
            Err(MuxError::InvalidInput(_))
        ));
        svc.cancel(&id).await.unwrap();
    }

    #[tokio::test]
    async fn cursor_position_request_is_answered_and_stripped() {
        let svc = service();
        // The reply arrives on stdin as if a terminal had answered.
        let id = svc
            .start(
                "s1",
                sh("stty raw -echo; printf 'ask\\033[6n'; dd bs=1 count=6 2>/dev/null | od -c | head -1; stty sane"),
                None,
            )
            .unwrap();
        let mut sub = svc.subscribe(&id).unwrap();
        let (output, _) = collect_until_exit(&mut sub).await;
        let text = String::from_utf8_lossy(&output);
        assert!(!text.contains("\x1b[6n"));
        assert!(text.contains("ask"));
        assert!(text.contains("033   [   1   ;   1   R"), "got: {text:?}");
    }

    #[test]
    fn spawn_error_for_missing_executable() {
        let svc = service();
        let err = svc
            .start("s1", PtyCommand::new("definitely-not-a-real-binary-xyz"), None)
            .unwrap_err();
        assert!(matches!(err, MuxError::Spawn(_)));
        assert!(svc.is_empty());
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn find_by_session_prefers_live_stream() {
        let svc = service();
        let done = svc.start("s1", sh("true"), None).unwrap();
        let mut sub = svc.subscribe(&done).unwrap();
        let _ = collect_until_exit(&mut sub).await;
        let live = svc.start("s1", sh("sleep 5"), None).unwrap();

        assert_eq!(svc.find_by_session("s1"), Some(live.clone()));
        assert_eq!(svc.find_by_session("other"), None);
        svc.cancel(&live).await.unwrap();
        assert!(svc.release(&done));
        assert!(!svc.release(&done));
    }

    #[tokio::test]
    async fn release_kills_a_running_process() {
        let svc = service();
        let id = svc.start("s1", sh("sleep 30"), None).unwrap();
        let pid = svc.pid(&id).unwrap();
        assert!(svc.release(&id));
        assert!(!svc.registry().contains(pid));
        for _ in 0..40 {
            if !registry::is_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {pid} survived release");
    }

    struct CountingSink(AtomicU64);

    impl OutputSink for CountingSink {
        fn record_output(&self, _data: &[u8], _has_ansi: bool) -> Result<u64, MuxError> {
            Ok(self.0.fetch_add(10, Ordering::SeqCst) + 10)
        }
    }

    #[tokio::test]
    async fn sink_assigns_sequence_numbers() {
        let svc = service();
        let sink = Arc::new(CountingSink(AtomicU64::new(0)));
        let id = svc.start("s1", sh("echo sunk"), Some(sink)).unwrap();
        let mut sub = svc.subscribe(&id).unwrap();
        let mut seqs = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), sub.recv())
                .await
                .unwrap()
                .unwrap()
            {
                PtyEvent::Output { seq, .. } => seqs.push(seq),
                PtyEvent::Exit { .. } => break,
                PtyEvent::Error { message } => panic!("{message}"),
            }
        }
        assert!(!seqs.is_empty());
        assert!(seqs.iter().all(|s| s % 10 == 0));
    }
}
