use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskmux_protocol::{ArtifactRef, LogEntry, Payload, SessionEvent, SessionId};

use crate::error::MuxError;
use crate::pty::OutputSink;

pub const DEFAULT_ARTIFACT_THRESHOLD: usize = 10 * 1024;
pub const DEFAULT_ARTIFACT_MAX: usize = 10 * 1024 * 1024;

/// Bytes read per `read_new` call. Grows only for a single longer line.
const READ_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Payloads longer than this are written to an artifact file.
    pub artifact_threshold: usize,
    /// Artifacts are truncated to this many bytes, plus a marker.
    pub artifact_max: usize,
    /// `sync_data` after every append.
    pub fsync: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            artifact_threshold: DEFAULT_ARTIFACT_THRESHOLD,
            artifact_max: DEFAULT_ARTIFACT_MAX,
            fsync: true,
        }
    }
}

/// Marker appended to payloads cut at the hard cap.
pub fn truncation_marker(max: usize) -> String {
    format!("\n[TRUNCATED - exceeded {max} byte limit]")
}

/// Position in a log file. Advances over complete lines only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    offset: u64,
}

impl LogCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

struct LogWriter {
    file: File,
    seq: u64,
    turn_id: Option<String>,
    /// A previous write failed part-way; start the next line fresh.
    torn: bool,
}

/// Append-only log for one session. The writer lock is the single point
/// where sequence numbers are assigned.
pub struct EventLog {
    session_id: SessionId,
    root: PathBuf,
    path: PathBuf,
    config: EventLogConfig,
    writer: Mutex<LogWriter>,
    latest: watch::Sender<u64>,
}

impl EventLog {
    /// Open or create the log, resuming the sequence from its last entry.
    pub fn open(
        root: impl Into<PathBuf>,
        session_id: &str,
        config: EventLogConfig,
    ) -> Result<Self, MuxError> {
        validate_session_id(session_id)?;
        let root = root.into();
        fs::create_dir_all(&root)?;
        let path = root.join(format!("{session_id}.jsonl"));

        let (last_seq, needs_newline) = scan_existing(&path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if needs_newline {
            file.write_all(b"\n")?;
        }
        if last_seq > 0 {
            debug!(session_id, last_seq, "resuming event log");
        }

        let (latest, _) = watch::channel(last_seq);
        Ok(Self {
            session_id: session_id.to_string(),
            root,
            path,
            config,
            writer: Mutex::new(LogWriter {
                file,
                seq: last_seq,
                turn_id: None,
                torn: false,
            }),
            latest,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assign the next sequence number, write one line and flush it to disk.
    pub fn append(&self, mut event: SessionEvent) -> Result<LogEntry, MuxError> {
        let mut writer = self.lock_writer();
        for (name, payload) in event.payloads_mut() {
            self.offload(name, payload)?;
        }

        let entry = LogEntry {
            event_id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            seq: writer.seq + 1,
            session_id: self.session_id.clone(),
            turn_id: writer.turn_id.clone(),
            event,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        if writer.torn {
            line.insert(0, b'\n');
        }

        let fsync = self.config.fsync;
        let written = (|| {
            writer.file.write_all(&line)?;
            writer.file.flush()?;
            if fsync {
                writer.file.sync_data()?;
            }
            Ok::<(), std::io::Error>(())
        })();
        if let Err(e) = written {
            writer.torn = true;
            return Err(MuxError::LogWrite(format!("{}: {e}", self.path.display())));
        }

        writer.torn = false;
        writer.seq = entry.seq;
        self.latest.send_replace(entry.seq);
        Ok(entry)
    }

    /// Entries with `seq > since_seq`, optionally limited to `types`.
    pub fn read(
        &self,
        since_seq: u64,
        types: Option<&[String]>,
    ) -> Result<Vec<LogEntry>, MuxError> {
        let mut cursor = LogCursor::default();
        let mut entries = Vec::new();
        loop {
            let before = cursor;
            let batch = self.read_new(&mut cursor)?;
            if cursor == before {
                break;
            }
            entries.extend(
                batch
                    .into_iter()
                    .filter(|e| e.seq > since_seq)
                    .filter(|e| types.is_none_or(|t| t.iter().any(|k| k == e.kind()))),
            );
        }
        Ok(entries)
    }

    /// Entries from the next chunk after `cursor`, advancing it past the last
    /// complete line read. Callers loop until the cursor stops moving.
    pub fn read_new(&self, cursor: &mut LogCursor) -> Result<Vec<LogEntry>, MuxError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(cursor.offset))?;

        let mut buf = Vec::new();
        let mut limit = READ_CHUNK;
        let end = loop {
            let wanted = limit - buf.len();
            let n = std::io::Read::by_ref(&mut file).take(wanted as u64).read_to_end(&mut buf)?;
            if let Some(end) = buf.iter().rposition(|b| *b == b'\n') {
                break end;
            }
            if n < wanted {
                return Ok(Vec::new());
            }
            limit *= 2;
        };

        let complete = &buf[..=end];
        let mut entries = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "skipping malformed event log line"
                ),
            }
        }
        cursor.offset += complete.len() as u64;
        Ok(entries)
    }

    /// `append` on the blocking pool, for callers on the async runtime.
    pub async fn append_async(self: &Arc<Self>, event: SessionEvent) -> Result<LogEntry, MuxError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.append(event))
            .await
            .map_err(|e| MuxError::LogWrite(format!("append task failed: {e}")))?
    }

    /// `read_new` on the blocking pool. Returns the advanced cursor.
    pub async fn read_new_async(
        self: &Arc<Self>,
        mut cursor: LogCursor,
    ) -> Result<(Vec<LogEntry>, LogCursor), MuxError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let entries = log.read_new(&mut cursor)?;
            Ok((entries, cursor))
        })
        .await
        .map_err(|e| MuxError::Stream(format!("log read task failed: {e}")))?
    }

    /// Contents of an artifact referenced by an entry of this log.
    pub fn read_artifact(&self, artifact: &ArtifactRef) -> Result<String, MuxError> {
        read_artifact(&self.root, artifact)
    }

    /// Start a new turn; later entries carry its id.
    pub fn start_turn(&self) -> String {
        let turn_id = uuid::Uuid::new_v4().to_string();
        self.lock_writer().turn_id = Some(turn_id.clone());
        turn_id
    }

    pub fn end_turn(&self) {
        self.lock_writer().turn_id = None;
    }

    pub fn latest_seq(&self) -> u64 {
        *self.latest.borrow()
    }

    /// Notified with the latest durable sequence number after each append.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }

    fn lock_writer(&self) -> MutexGuard<'_, LogWriter> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offload(&self, name: &str, payload: &mut Payload) -> Result<(), MuxError> {
        let Payload::Inline(content) = payload else {
            return Ok(());
        };
        if content.len() <= self.config.artifact_threshold {
            return Ok(());
        }

        let max = self.config.artifact_max;
        let (body, truncated) = if content.len() > max {
            let cut = floor_char_boundary(content, max);
            (format!("{}{}", &content[..cut], truncation_marker(max)), true)
        } else {
            (std::mem::take(content), false)
        };

        let hash = hex::encode(Sha256::digest(body.as_bytes()));
        let relative = format!("artifacts/{}/{}_{}.txt", self.session_id, name, &hash[..8]);
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MuxError::LogWrite(format!("{}: {e}", parent.display())))?;
        }
        fs::write(&full, body.as_bytes())
            .map_err(|e| MuxError::LogWrite(format!("{}: {e}", full.display())))?;
        info!(
            session_id = %self.session_id,
            path = %relative,
            size = body.len(),
            truncated,
            "payload off-loaded to artifact"
        );

        *payload = Payload::Artifact(ArtifactRef {
            path: relative,
            content_hash: hash,
            size: body.len() as u64,
            truncated,
        });
        Ok(())
    }
}

/// Records raw PTY output as `terminal_chunk` entries.
pub struct LogSink {
    log: Arc<EventLog>,
}

impl LogSink {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

impl OutputSink for LogSink {
    fn record_output(&self, data: &[u8], has_ansi: bool) -> Result<u64, MuxError> {
        self.log
            .append(SessionEvent::TerminalChunk {
                data: data.to_vec(),
                has_ansi,
            })
            .map(|entry| entry.seq)
    }
}

/// All session logs under one root directory.
pub struct EventStore {
    root: PathBuf,
    config: EventLogConfig,
    logs: Mutex<HashMap<SessionId, Arc<EventLog>>>,
}

impl EventStore {
    pub fn new(root: impl Into<PathBuf>, config: EventLogConfig) -> Result<Self, MuxError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            config,
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The session's log, opened on first use.
    pub fn open(&self, session_id: &str) -> Result<Arc<EventLog>, MuxError> {
        if let Some(log) = self.lock_logs().get(session_id) {
            return Ok(Arc::clone(log));
        }
        // Scanning an existing file can be slow; keep the map unlocked meanwhile.
        let log = Arc::new(EventLog::open(&self.root, session_id, self.config.clone())?);
        let mut logs = self.lock_logs();
        Ok(Arc::clone(
            logs.entry(session_id.to_string()).or_insert(log),
        ))
    }

    pub fn append(&self, session_id: &str, event: SessionEvent) -> Result<LogEntry, MuxError> {
        self.open(session_id)?.append(event)
    }

    pub fn read(
        &self,
        session_id: &str,
        since_seq: u64,
        types: Option<&[String]>,
    ) -> Result<Vec<LogEntry>, MuxError> {
        self.open(session_id)?.read(since_seq, types)
    }

    /// `read` on the blocking pool.
    pub async fn read_async(
        self: &Arc<Self>,
        session_id: &str,
        since_seq: u64,
        types: Option<Vec<String>>,
    ) -> Result<Vec<LogEntry>, MuxError> {
        let store = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || store.read(&session_id, since_seq, types.as_deref()))
            .await
            .map_err(|e| MuxError::Stream(format!("log read task failed: {e}")))?
    }

    pub fn read_artifact(&self, artifact: &ArtifactRef) -> Result<String, MuxError> {
        read_artifact(&self.root, artifact)
    }

    pub fn has_log(&self, session_id: &str) -> bool {
        validate_session_id(session_id).is_ok()
            && self.root.join(format!("{session_id}.jsonl")).is_file()
    }

    /// Ids of every session with a log file on disk.
    pub fn list_sessions(&self) -> Result<Vec<SessionId>, MuxError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Drop the cached handle; the file stays on disk.
    pub fn forget(&self, session_id: &str) {
        self.lock_logs().remove(session_id);
    }

    fn lock_logs(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<EventLog>>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_artifact(root: &Path, artifact: &ArtifactRef) -> Result<String, MuxError> {
    let relative = Path::new(&artifact.path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(MuxError::InvalidInput(format!(
            "artifact path escapes log root: {}",
            artifact.path
        )));
    }
    Ok(fs::read_to_string(root.join(relative))?)
}

/// Highest seq among parseable lines, and whether the file lacks a final newline.
fn scan_existing(path: &Path) -> Result<(u64, bool), MuxError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut last_seq = 0;
    let mut line = Vec::new();
    let mut ends_with_newline = true;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        ends_with_newline = line.ends_with(b"\n");
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&line) {
            if let Some(seq) = value.get("seq").and_then(|s| s.as_u64()) {
                last_seq = last_seq.max(seq);
            }
        }
    }
    Ok((last_seq, !ends_with_newline))
}

fn validate_session_id(session_id: &str) -> Result<(), MuxError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MuxError::InvalidInput(format!(
            "invalid session id: {session_id:?}"
        )))
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
